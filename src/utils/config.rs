//! Configuration string parsing helper macro.

/// Builds a config struct of given type from an optional TOML string,
/// keeping the struct's `Default` value for any field not present in the
/// string. Unknown keys are rejected.
#[macro_export]
macro_rules! parsed_config {
    ($conf_str:expr => $conf_type:ty; $($field:ident),+ $(,)?) => {{
        (|| -> Result<$conf_type, $crate::SubastaError> {
            let mut config = <$conf_type>::default();
            if let Some(conf_str) = $conf_str {
                let table: toml::Table = conf_str.parse()?;
                for (key, value) in table {
                    match key.as_str() {
                        $(
                            stringify!($field) => {
                                config.$field = value.try_into()?;
                            }
                        )+
                        _ => {
                            return $crate::logged_err!(
                                "unknown config field '{}'",
                                key
                            );
                        }
                    }
                }
            }
            Ok(config)
        })()
    }};
}
