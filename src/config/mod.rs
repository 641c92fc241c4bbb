pub mod settings;

pub use settings::{
    generate_default_config, BackendSettings, LimitSettings, NetworkSettings, Settings,
};
