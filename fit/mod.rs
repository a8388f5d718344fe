pub mod lasso;
pub mod model;
pub mod normalize;
pub mod reduced;
pub mod select;
