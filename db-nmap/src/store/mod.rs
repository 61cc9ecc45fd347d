pub mod db;
pub mod merge;
pub mod supervisor;
