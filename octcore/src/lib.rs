// data module
pub mod data {
    pub mod dimension;
    pub mod frame;
}

// transform module
pub mod transform {
    pub mod focus;
    pub mod spectral;
}

// surface module
pub mod surface {
    pub mod estimator;
    pub mod filters;
}

pub mod error;
