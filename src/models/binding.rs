//! Declared inputs and outputs of one unit of work, as handed over by the
//! surrounding framework.

use crate::{errors::LocalizeResult, services::proxy::PathProxy};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputValue {
    /// Plain value; never touched.
    Var(String),
    File(PathProxy),
    Dir(PathProxy),
    Files(Vec<PathProxy>),
    Dirs(Vec<PathProxy>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputBinding {
    pub name: String,
    pub value: InputValue,
}

impl InputBinding {
    pub fn var(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: InputValue::Var(value.into()),
        }
    }

    pub fn file(name: impl Into<String>, declared: &str) -> LocalizeResult<Self> {
        Ok(Self {
            name: name.into(),
            value: InputValue::File(PathProxy::from_declared(declared, false)?),
        })
    }

    pub fn dir(name: impl Into<String>, declared: &str) -> LocalizeResult<Self> {
        Ok(Self {
            name: name.into(),
            value: InputValue::Dir(PathProxy::from_declared(declared, true)?),
        })
    }

    pub fn files<'a>(
        name: impl Into<String>,
        declared: impl IntoIterator<Item = &'a str>,
    ) -> LocalizeResult<Self> {
        let paths = declared
            .into_iter()
            .map(|value| PathProxy::from_declared(value, false))
            .collect::<LocalizeResult<Vec<_>>>()?;
        Ok(Self {
            name: name.into(),
            value: InputValue::Files(paths),
        })
    }

    pub fn dirs<'a>(
        name: impl Into<String>,
        declared: impl IntoIterator<Item = &'a str>,
    ) -> LocalizeResult<Self> {
        let paths = declared
            .into_iter()
            .map(|value| PathProxy::from_declared(value, true))
            .collect::<LocalizeResult<Vec<_>>>()?;
        Ok(Self {
            name: name.into(),
            value: InputValue::Dirs(paths),
        })
    }

    /// Paths as the unit's script should see them.
    pub fn rendered(&self) -> Vec<String> {
        match &self.value {
            InputValue::Var(value) => vec![value.clone()],
            InputValue::File(path) | InputValue::Dir(path) => vec![path.rendered()],
            InputValue::Files(paths) | InputValue::Dirs(paths) => {
                paths.iter().map(PathProxy::rendered).collect()
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputValue {
    Var(String),
    File(PathProxy),
    Dir(PathProxy),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputBinding {
    pub name: String,
    pub value: OutputValue,
}

impl OutputBinding {
    pub fn file(name: impl Into<String>, declared: &str) -> LocalizeResult<Self> {
        Ok(Self {
            name: name.into(),
            value: OutputValue::File(PathProxy::from_declared(declared, false)?),
        })
    }

    pub fn dir(name: impl Into<String>, declared: &str) -> LocalizeResult<Self> {
        Ok(Self {
            name: name.into(),
            value: OutputValue::Dir(PathProxy::from_declared(declared, true)?),
        })
    }

    pub fn path(&self) -> Option<&PathProxy> {
        match &self.value {
            OutputValue::Var(_) => None,
            OutputValue::File(path) | OutputValue::Dir(path) => Some(path),
        }
    }

    pub fn rendered(&self) -> String {
        match &self.value {
            OutputValue::Var(value) => value.clone(),
            OutputValue::File(path) | OutputValue::Dir(path) => path.rendered(),
        }
    }
}
