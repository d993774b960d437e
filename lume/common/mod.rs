pub mod constants;
pub mod options;
