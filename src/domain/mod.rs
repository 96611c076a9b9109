// Domain layer: environment, process, query and secret models plus the ports the core is written against.

pub mod model;
pub mod ports;
