pub mod coordination;
pub mod data_plane;
pub mod discovery;
pub mod model;
