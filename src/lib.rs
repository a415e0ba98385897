pub mod data;
pub mod dataset;
pub mod loader;
pub mod logger;
pub mod model;
pub mod training;
