pub mod listener;
pub mod logging;
