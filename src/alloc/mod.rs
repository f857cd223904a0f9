pub mod header;
pub mod raw;
pub mod table;
pub mod tracking;
