use super::collective::{CollectiveConfig, CollectiveLogLevel};
use alloc::sync::Arc;

/// Static mutex holding the global configuration, initialized as `None`.
static COLLECTIVE_GLOBAL_CONFIG: spin::Mutex<Option<Arc<GlobalConfig>>> = spin::Mutex::new(None);

/// The global configuration of the collective layer.
#[derive(Default, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct GlobalConfig {
    /// Configuration of the process groups.
    #[serde(default)]
    pub collective: CollectiveConfig,
}

impl GlobalConfig {
    /// Retrieves the current global configuration, loading it from the current directory if not set.
    ///
    /// If no configuration is set, it attempts to load one from `cubecl.toml` or `CubeCL.toml` in the
    /// current directory or its parents, then applies the [environment overrides](Self::override_from_env).
    /// If no file is found, a default configuration is used.
    pub fn get() -> Arc<Self> {
        let mut state = COLLECTIVE_GLOBAL_CONFIG.lock();

        match state.as_ref() {
            Some(config) => config.clone(),
            None => {
                let config = Arc::new(Self::from_current_dir().override_from_env());
                *state = Some(config.clone());
                config
            }
        }
    }

    /// Save the current configuration to the provided file path.
    pub fn save_default<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<()> {
        let config = Self::get();
        let content = toml::to_string_pretty(config.as_ref())
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        std::fs::write(path, content)
    }

    /// Sets the global configuration to the provided value.
    ///
    /// # Panics
    /// Panics if the configuration has already been set or read, as it cannot be overridden.
    ///
    /// # Warning
    /// This method must be called at the start of the program, before any calls to `get`.
    pub fn set(config: Self) {
        let mut state = COLLECTIVE_GLOBAL_CONFIG.lock();
        if state.is_some() {
            panic!("Cannot set the global configuration multiple times.");
        }
        *state = Some(Arc::new(config));
    }

    /// Overrides configuration fields based on environment variables.
    pub fn override_from_env(mut self) -> Self {
        let collective = &mut self.collective;

        if let Ok(val) = std::env::var("CUBECL_DEBUG_LOG") {
            collective.logger.level = CollectiveLogLevel::Full;

            match val.as_str() {
                "stdout" => {
                    collective.logger.stdout = true;
                }
                "stderr" => {
                    collective.logger.stderr = true;
                }
                "1" | "true" => {
                    collective.logger.file = Some("/tmp/cubecl.log".into());
                }
                "0" | "false" => {
                    collective.logger.level = CollectiveLogLevel::Disabled;
                }
                file_path => {
                    collective.logger.file = Some(file_path.into());
                }
            }
        };

        if let Some(val) = env_flag("CUBECL_COLLECTIVE_BLOCKING_WAIT") {
            collective.blocking_wait = val;
        }

        if let Some(val) = env_flag("CUBECL_COLLECTIVE_STREAM_SAFE") {
            collective.stream_safe_allocator = val;
        }

        if let Ok(val) = std::env::var("CUBECL_COLLECTIVE_WAIT_TIMEOUT_MS") {
            match val.parse() {
                Ok(timeout) => collective.wait.default_timeout_ms = timeout,
                Err(_) => log::warn!("Ignoring invalid CUBECL_COLLECTIVE_WAIT_TIMEOUT_MS `{val}`"),
            }
        }

        self
    }

    // Loads configuration from `cubecl.toml` or `CubeCL.toml` in the current directory or its parents.
    //
    // Traverses up the directory tree until a valid configuration file is found or the root is reached.
    // Returns a default configuration if no file is found.
    fn from_current_dir() -> Self {
        let Ok(mut dir) = std::env::current_dir() else {
            return Self::default();
        };

        loop {
            for name in ["cubecl.toml", "CubeCL.toml"] {
                let path = dir.join(name);
                if !path.is_file() {
                    continue;
                }

                match Self::from_file_path(&path) {
                    Ok(config) => return config,
                    Err(err) => log::warn!("Ignoring config file {}: {err}", path.display()),
                }
            }

            if !dir.pop() {
                break;
            }
        }

        Self::default()
    }

    // Loads configuration from a specified file path.
    fn from_file_path<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;

        toml::from_str(&content)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;

    match val.as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => {
            log::warn!("Ignoring invalid {name} `{val}`");
            None
        }
    }
}
