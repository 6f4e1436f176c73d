use std::fmt;
use std::sync::Arc;

use rusty_cluster_browser::ConcurrencyBackend;
use rusty_cluster_core::ConcurrencyModel;

pub use rusty_cluster_core::ClusterOptions;

/// Which concurrency backend the cluster runs on.
#[derive(Clone)]
pub enum Concurrency {
    Page,
    Context,
    Browser,
    /// A caller-supplied backend.
    Custom(Arc<dyn ConcurrencyBackend>),
}

impl Concurrency {
    /// The built-in model, if this is one.
    pub fn model(&self) -> Option<ConcurrencyModel> {
        match self {
            Self::Page => Some(ConcurrencyModel::Page),
            Self::Context => Some(ConcurrencyModel::Context),
            Self::Browser => Some(ConcurrencyModel::Browser),
            Self::Custom(_) => None,
        }
    }
}

impl From<ConcurrencyModel> for Concurrency {
    fn from(model: ConcurrencyModel) -> Self {
        match model {
            ConcurrencyModel::Page => Self::Page,
            ConcurrencyModel::Context => Self::Context,
            ConcurrencyModel::Browser => Self::Browser,
        }
    }
}

impl fmt::Debug for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Page => f.write_str("Page"),
            Self::Context => f.write_str("Context"),
            Self::Browser => f.write_str("Browser"),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_round_trip() {
        for model in [
            ConcurrencyModel::Page,
            ConcurrencyModel::Context,
            ConcurrencyModel::Browser,
        ] {
            assert_eq!(Concurrency::from(model).model(), Some(model));
        }
    }
}
