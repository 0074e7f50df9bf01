pub mod contexts;
pub mod heartbeat;
pub mod model;
pub mod reset;
pub mod run;
pub mod serve;
pub mod utils;
