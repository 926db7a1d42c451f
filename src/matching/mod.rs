pub mod centroid;
pub mod db;
pub mod manager;
pub mod residual;
