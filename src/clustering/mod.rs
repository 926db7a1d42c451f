pub mod create_clusters;
pub mod db;
pub mod dbscan;
pub mod hybrid_distance;
pub mod quality;
pub mod title;
