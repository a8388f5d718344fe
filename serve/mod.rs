pub mod service;
pub mod similarity;
pub mod vector;
