pub mod derive;
pub mod impute;
pub mod schema;
pub mod table;
pub mod warehouse;
