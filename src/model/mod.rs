pub mod actor;
pub mod audit;
pub mod building;
pub mod common;
pub mod entity;
pub mod function;
pub mod history;
pub mod organization;
pub mod outcome;
pub mod region;
pub mod requests;

pub use actor::*;
pub use audit::*;
pub use building::*;
pub use common::*;
pub use entity::*;
pub use function::*;
pub use history::*;
pub use organization::*;
pub use outcome::*;
pub use region::*;
pub use requests::*;
