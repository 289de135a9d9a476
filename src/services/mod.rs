pub mod accessor;
pub mod atomic;
pub mod cache;
pub mod hooks;
pub mod keyed_lock;
pub mod local_fs;
pub mod proxy;
pub mod runner;
