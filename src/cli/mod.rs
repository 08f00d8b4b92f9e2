pub mod install;
pub mod proxy;
