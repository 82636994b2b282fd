use crate::constants::limits::{MAX_PORT, MIN_PORT};
use crate::errors::LaunchError;
use serde_json::{Map, Value};

#[derive(Clone)]
pub struct Validation;

impl Validation {
    pub fn new() -> Self {
        Self
    }

    pub fn ensure_string(
        &self,
        value: &Value,
        label: &str,
        trim: bool,
    ) -> Result<String, LaunchError> {
        let text = value.as_str().ok_or_else(|| {
            LaunchError::invalid_config(format!("{} must be a non-empty string", label))
        })?;
        let normalized = text.trim();
        if normalized.is_empty() {
            return Err(LaunchError::invalid_config(format!(
                "{} must be a non-empty string",
                label
            )));
        }
        Ok(if trim {
            normalized.to_string()
        } else {
            text.to_string()
        })
    }

    pub fn ensure_optional_string(
        &self,
        value: Option<&Value>,
        label: &str,
        trim: bool,
    ) -> Result<Option<String>, LaunchError> {
        match value {
            None => Ok(None),
            Some(val) if val.is_null() => Ok(None),
            Some(Value::String(text)) if text.trim().is_empty() => Ok(None),
            Some(val) => self.ensure_string(val, label, trim).map(Some),
        }
    }

    /// Free-form text where empty is a legitimate value (jvm options,
    /// command prefixes).
    pub fn ensure_text(&self, value: Option<&Value>, label: &str) -> Result<String, LaunchError> {
        match value {
            None | Some(Value::Null) => Ok(String::new()),
            Some(Value::String(text)) => Ok(text.trim().to_string()),
            Some(_) => Err(LaunchError::invalid_config(format!(
                "{} must be a string",
                label
            ))),
        }
    }

    pub fn ensure_port(
        &self,
        value: Option<&Value>,
        fallback: Option<u16>,
    ) -> Result<u16, LaunchError> {
        let Some(value) = value else {
            return Ok(fallback.unwrap_or(MIN_PORT));
        };
        if value.is_null() {
            return Ok(fallback.unwrap_or(MIN_PORT));
        }
        let numeric = value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
            .ok_or_else(|| {
                LaunchError::invalid_config(format!(
                    "Port must be an integer between {} and {}",
                    MIN_PORT, MAX_PORT
                ))
            })?;
        if numeric < MIN_PORT as i64 || numeric > MAX_PORT as i64 {
            return Err(LaunchError::invalid_config(format!(
                "Port must be an integer between {} and {}",
                MIN_PORT, MAX_PORT
            )));
        }
        Ok(numeric as u16)
    }

    pub fn ensure_non_negative(
        &self,
        value: Option<&Value>,
        label: &str,
        fallback: u64,
    ) -> Result<u64, LaunchError> {
        let Some(value) = value else {
            return Ok(fallback);
        };
        if value.is_null() {
            return Ok(fallback);
        }
        let numeric = value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
            .ok_or_else(|| {
                LaunchError::invalid_config(format!("{} must be a non-negative integer", label))
            })?;
        if numeric < 0 {
            return Err(LaunchError::invalid_config(format!(
                "{} must be a non-negative integer",
                label
            )));
        }
        Ok(numeric as u64)
    }

    pub fn ensure_bool(
        &self,
        value: Option<&Value>,
        label: &str,
        fallback: bool,
    ) -> Result<bool, LaunchError> {
        match value {
            None | Some(Value::Null) => Ok(fallback),
            Some(Value::Bool(flag)) => Ok(*flag),
            Some(Value::String(text)) => match text.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(LaunchError::invalid_config(format!(
                    "{} must be a boolean",
                    label
                ))),
            },
            Some(_) => Err(LaunchError::invalid_config(format!(
                "{} must be a boolean",
                label
            ))),
        }
    }

    pub fn ensure_identifier(&self, value: &str, label: &str) -> Result<String, LaunchError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(LaunchError::invalid_config(format!(
                "{} must be a non-empty string",
                label
            )));
        }
        if trimmed.contains('\0') {
            return Err(LaunchError::invalid_config(format!(
                "{} must not contain null bytes",
                label
            )));
        }
        Ok(trimmed.to_string())
    }

    pub fn ensure_string_map(
        &self,
        value: Option<&Value>,
        label: &str,
    ) -> Result<Vec<(String, String)>, LaunchError> {
        let Some(value) = value else {
            return Ok(Vec::new());
        };
        if value.is_null() {
            return Ok(Vec::new());
        }
        let obj: &Map<String, Value> = value
            .as_object()
            .ok_or_else(|| LaunchError::invalid_config(format!("{} must be an object", label)))?;
        let mut out = Vec::new();
        for (key, val) in obj.iter() {
            if key.trim().is_empty() || val.is_null() {
                continue;
            }
            let rendered = val
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or_else(|| val.to_string());
            out.push((key.trim().to_string(), rendered));
        }
        Ok(out)
    }

    pub fn ensure_string_list(
        &self,
        value: Option<&Value>,
        label: &str,
    ) -> Result<Vec<String>, LaunchError> {
        let Some(value) = value else {
            return Ok(Vec::new());
        };
        if value.is_null() {
            return Ok(Vec::new());
        }
        let arr = value
            .as_array()
            .ok_or_else(|| LaunchError::invalid_config(format!("{} must be an array", label)))?;
        let mut out = Vec::new();
        for entry in arr {
            let text = entry.as_str().ok_or_else(|| {
                LaunchError::invalid_config(format!("{} entries must be strings", label))
            })?;
            if !text.trim().is_empty() {
                out.push(text.trim().to_string());
            }
        }
        Ok(out)
    }
}

impl Default for Validation {
    fn default() -> Self {
        Self::new()
    }
}
