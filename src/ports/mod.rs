pub mod in_ports {
    pub use super::input::*;
}

pub mod out_ports {
    pub use super::output::*;
}

pub mod input;
pub mod output;
