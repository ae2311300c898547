use ord_config::InscriberConfig;

use crate::{envy_load, FromEnv};

impl FromEnv for InscriberConfig {
    fn from_env() -> anyhow::Result<Self> {
        let config: Self = envy_load("inscriber", "INSCRIBER_")?;
        config.validate()?;
        Ok(config)
    }
}
