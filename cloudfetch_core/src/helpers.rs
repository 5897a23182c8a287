//! Plumbing for the configuration value types
//!
//! Each recognized option is a small newtype over its raw value. The
//! macros here generate the conversions and the environment-variable
//! constructors; the actual lookup and parsing lives in plain
//! functions so the macro bodies stay thin.
use anyhow::{anyhow, Error as AnyError};

pub(crate) const ENV_PREFIX: &str = "CLOUDFETCH";

/// `PREFIX_NAME`, or just `NAME` for an empty prefix.
pub(crate) fn env_var_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}_{name}")
    }
}

/// Looks up `var_name` and parses it.
///
/// An unset variable is `Ok(None)`; a set but unparseable one is an
/// error.
pub(crate) fn parse_env_var<T>(var_name: &str) -> Result<Option<T>, AnyError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(var_name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => Ok(Some(value)),
            Err(err) => Err(anyhow!("env var '{var_name}' does not parse: {err}")),
        },
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => {
            Err(anyhow!("env var '{var_name}' is not valid unicode"))
        }
    }
}

macro_rules! env_accessors {
    ($var:literal) => {
        #[doc = concat!("Reads this value from `<prefix>_", $var, "`.")]
        #[doc = ""]
        #[doc = "An unset variable is `Ok(None)`; a set but unparseable one is an error."]
        pub fn try_from_env_prefixed<P: AsRef<str>>(
            prefix: P,
        ) -> Result<Option<Self>, anyhow::Error> {
            let var_name = $crate::helpers::env_var_name(prefix.as_ref(), $var);
            $crate::helpers::parse_env_var(&var_name)
        }

        #[doc = "Reads this value from the exact variable `var_name`."]
        pub fn try_from_env_named<N: AsRef<str>>(
            var_name: N,
        ) -> Result<Option<Self>, anyhow::Error> {
            $crate::helpers::parse_env_var(var_name.as_ref())
        }

        #[doc = concat!("Reads this value from `CLOUDFETCH_", $var, "`.")]
        #[doc = ""]
        #[doc = "Fails when the variable is unset or does not parse."]
        pub fn from_env() -> Result<Self, anyhow::Error> {
            let var_name = $crate::helpers::env_var_name($crate::helpers::ENV_PREFIX, $var);
            $crate::helpers::parse_env_var(&var_name)?
                .ok_or_else(|| anyhow::anyhow!("env var '{}' is not set", var_name))
        }
    };
}

macro_rules! value_impls {
    ($Name:ident, $T:ty, $env:literal) => {
        impl $Name {
            pub fn new<V: Into<$T>>(value: V) -> Self {
                Self(value.into())
            }

            pub fn into_inner(self) -> $T {
                self.0
            }

            env_accessors!($env);
        }

        impl From<$T> for $Name {
            fn from(value: $T) -> Self {
                Self(value)
            }
        }

        impl From<$Name> for $T {
            fn from(value: $Name) -> $T {
                value.0
            }
        }

        impl std::fmt::Display for $Name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.0, f)
            }
        }

        impl std::str::FromStr for $Name {
            type Err = anyhow::Error;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                raw.parse().map(Self).map_err(|err| {
                    anyhow::anyhow!(
                        "'{raw}' is not a valid {}: {err}",
                        std::stringify!($Name)
                    )
                })
            }
        }
    };
}

macro_rules! config_value {
    ($(#[$attr:meta])* pub copy struct $Name:ident($T:ty, env=$env:literal);) => {
        $(#[$attr])*
        pub struct $Name($T);

        value_impls!($Name, $T, $env);
    };
    ($(#[$attr:meta])* pub secs struct $Name:ident($T:ty, env=$env:literal);) => {
        config_value! { $(#[$attr])* pub copy struct $Name($T, env=$env); }

        impl $Name {
            pub fn into_duration(self) -> Duration {
                Duration::from_secs(u64::from(self.0))
            }
        }

        impl From<$Name> for Duration {
            fn from(value: $Name) -> Duration {
                value.into_duration()
            }
        }
    };
    ($(#[$attr:meta])* pub millis struct $Name:ident($T:ty, env=$env:literal);) => {
        config_value! { $(#[$attr])* pub copy struct $Name($T, env=$env); }

        impl $Name {
            pub fn into_duration(self) -> Duration {
                Duration::from_millis(u64::from(self.0))
            }
        }

        impl From<$Name> for Duration {
            fn from(value: $Name) -> Duration {
                value.into_duration()
            }
        }
    };
    ($(#[$attr:meta])* pub mins struct $Name:ident($T:ty, env=$env:literal);) => {
        config_value! { $(#[$attr])* pub copy struct $Name($T, env=$env); }

        impl $Name {
            pub fn into_duration(self) -> Duration {
                Duration::from_secs(u64::from(self.0) * 60)
            }
        }

        impl From<$Name> for Duration {
            fn from(value: $Name) -> Duration {
                value.into_duration()
            }
        }
    };
}

macro_rules! config_env_ctors {
    () => {
        /// Builds a config from `CLOUDFETCH_*` environment variables.
        ///
        /// `Ok(None)` when not a single variable is set; otherwise the
        /// set values override the defaults.
        pub fn from_env() -> Result<Option<Self>, anyhow::Error> {
            Self::from_env_prefixed($crate::helpers::ENV_PREFIX)
        }

        /// Like `from_env`, with a custom variable prefix.
        ///
        /// The underscore after the prefix is dropped when the prefix
        /// is empty.
        pub fn from_env_prefixed<P: AsRef<str>>(prefix: P) -> Result<Option<Self>, anyhow::Error> {
            let mut config = Self::default();
            let found_any = config.fill_from_env_prefixed_internal(prefix)?;
            Ok(found_any.then_some(config))
        }

        /// Overrides fields from `CLOUDFETCH_*` variables in place.
        pub fn fill_from_env(&mut self) -> Result<(), anyhow::Error> {
            self.fill_from_env_prefixed($crate::helpers::ENV_PREFIX)
        }

        /// Like `fill_from_env`, with a custom variable prefix.
        pub fn fill_from_env_prefixed<P: AsRef<str>>(
            &mut self,
            prefix: P,
        ) -> Result<(), anyhow::Error> {
            self.fill_from_env_prefixed_internal(prefix).map(drop)
        }
    };
}
