pub mod feature;
pub mod phase;
pub mod session;
pub mod task;
