// scan module
pub mod scan {
    pub mod config;
    pub mod frame;
    pub mod grid;
}

// stitch module
pub mod stitch {
    pub mod accumulator;
    pub mod loader;
    pub mod sink;
}
