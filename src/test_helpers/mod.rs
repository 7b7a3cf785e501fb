pub mod fixtures;
pub mod peripheral;
pub mod temp;
