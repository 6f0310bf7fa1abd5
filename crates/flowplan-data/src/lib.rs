pub mod loader;

pub use loader::{DataLoadError, load_config, load_graph, save_graph};
