pub mod runs;

pub use runs::build_router;
