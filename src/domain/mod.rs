pub mod geometry;
pub mod history;
pub mod power;
pub mod series;
pub mod tunnel;

pub use geometry::*;
pub use history::*;
pub use power::*;
pub use series::*;
pub use tunnel::*;
