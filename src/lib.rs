//! Interest-rate prediction for consumer lending: an offline pipeline that
//! cleans warehouse rows, ranks predictors with a cross-validated LASSO path and
//! fits a small reduced model, plus the serving side that predicts a rate and
//! compares an applicant with similar historical ones.

#![deny(dead_code)]
#![deny(unused_imports)]

#[path = "../prepare/mod.rs"]
pub mod prepare;

#[path = "../fit/mod.rs"]
pub mod fit;

#[path = "../serve/mod.rs"]
pub mod serve;

pub mod config;
pub mod pipeline;
