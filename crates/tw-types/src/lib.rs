pub mod config;
pub mod errors;
pub mod orders;
pub mod positions;
pub mod reports;
pub mod safety;
pub mod services;

pub use config::*;
pub use errors::*;
pub use orders::*;
pub use positions::*;
pub use reports::*;
pub use safety::*;
pub use services::*;
