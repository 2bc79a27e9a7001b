use serde_json::{json, Map, Value};

use crate::error::ToolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Boolean,
    StringList,
}

impl ParamType {
    fn json_type(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::StringList => "array",
        }
    }
}

/// One declared parameter. `min`/`max` bound the value for integers, the
/// character count for strings, and the item count for lists.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamType,
    pub description: &'static str,
    pub required: bool,
    pub default: Option<Value>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub allowed: Option<&'static [&'static str]>,
}

impl ParamSpec {
    fn new(name: &'static str, kind: ParamType, description: &'static str) -> Self {
        Self {
            name,
            kind,
            description,
            required: false,
            default: None,
            min: None,
            max: None,
            allowed: None,
        }
    }

    pub fn string(name: &'static str, description: &'static str) -> Self {
        Self::new(name, ParamType::String, description)
    }

    pub fn integer(name: &'static str, description: &'static str) -> Self {
        Self::new(name, ParamType::Integer, description)
    }

    pub fn boolean(name: &'static str, description: &'static str) -> Self {
        Self::new(name, ParamType::Boolean, description)
    }

    pub fn string_list(name: &'static str, description: &'static str) -> Self {
        Self::new(name, ParamType::StringList, description)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn min(mut self, min: i64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: i64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn range(self, min: i64, max: i64) -> Self {
        self.min(min).max(max)
    }

    /// Restrict a string (or every list item) to a fixed set of values.
    pub fn one_of(mut self, allowed: &'static [&'static str]) -> Self {
        self.allowed = Some(allowed);
        self
    }

    fn check_bounds(&self, measured: i64, unit: &str) -> Result<(), ToolError> {
        if let Some(min) = self.min {
            if measured < min {
                return Err(ToolError::invalid(match unit {
                    "" => format!("'{}' must be at least {min}", self.name),
                    _ => format!("'{}' must have at least {min} {unit}", self.name),
                }));
            }
        }
        if let Some(max) = self.max {
            if measured > max {
                return Err(ToolError::invalid(match unit {
                    "" => format!("'{}' must be at most {max}", self.name),
                    _ => format!("'{}' must have at most {max} {unit}", self.name),
                }));
            }
        }
        Ok(())
    }

    fn check_allowed(&self, value: &str) -> Result<(), ToolError> {
        match self.allowed {
            Some(allowed) if !allowed.contains(&value) => Err(ToolError::invalid(format!(
                "'{}' does not accept {value:?}; expected one of: {}",
                self.name,
                allowed.join(", ")
            ))),
            _ => Ok(()),
        }
    }

    fn check(&self, value: &Value) -> Result<(), ToolError> {
        let wrong_type = || {
            ToolError::invalid(format!(
                "'{}' must be of type {}",
                self.name,
                self.kind.json_type()
            ))
        };
        match self.kind {
            ParamType::String => {
                let s = value.as_str().ok_or_else(wrong_type)?;
                self.check_bounds(s.chars().count() as i64, "characters")?;
                self.check_allowed(s)
            }
            ParamType::Integer => {
                let n = value.as_i64().ok_or_else(wrong_type)?;
                self.check_bounds(n, "")
            }
            ParamType::Boolean => value.as_bool().map(|_| ()).ok_or_else(wrong_type),
            ParamType::StringList => {
                let items = value.as_array().ok_or_else(wrong_type)?;
                self.check_bounds(items.len() as i64, "items")?;
                for item in items {
                    let s = item.as_str().ok_or_else(|| {
                        ToolError::invalid(format!("'{}' items must be strings", self.name))
                    })?;
                    self.check_allowed(s)?;
                }
                Ok(())
            }
        }
    }

    fn to_json(&self) -> Value {
        let mut prop = json!({
            "type": self.kind.json_type(),
            "description": self.description,
        });
        if self.kind == ParamType::StringList {
            prop["items"] = json!({"type": "string"});
        }
        if let Some(ref default) = self.default {
            prop["default"] = default.clone();
        }
        if let Some(allowed) = self.allowed {
            let target = if self.kind == ParamType::StringList {
                &mut prop["items"]
            } else {
                &mut prop
            };
            target["enum"] = json!(allowed);
        }
        let (min_key, max_key) = match self.kind {
            ParamType::Integer => ("minimum", "maximum"),
            ParamType::String => ("minLength", "maxLength"),
            ParamType::StringList => ("minItems", "maxItems"),
            ParamType::Boolean => return prop,
        };
        if let Some(min) = self.min {
            prop[min_key] = json!(min);
        }
        if let Some(max) = self.max {
            prop[max_key] = json!(max);
        }
        prop
    }
}

/// The full parameter list of a tool. Parameters not declared here are rejected.
#[derive(Debug, Clone, Default)]
pub struct ParamSchema {
    params: Vec<ParamSpec>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Check `args` against every declared parameter and fill in defaults.
    /// JSON `null` counts as absent.
    pub fn validate(&self, args: &Map<String, Value>) -> Result<Args, ToolError> {
        if let Some(unknown) = args
            .keys()
            .find(|key| !self.params.iter().any(|p| p.name == key.as_str()))
        {
            return Err(ToolError::invalid(format!("unknown parameter '{unknown}'")));
        }

        let mut values = Map::new();
        for spec in &self.params {
            match args.get(spec.name).filter(|v| !v.is_null()) {
                Some(value) => {
                    spec.check(value)?;
                    values.insert(spec.name.to_string(), value.clone());
                }
                None => {
                    if let Some(ref default) = spec.default {
                        values.insert(spec.name.to_string(), default.clone());
                    } else if spec.required {
                        return Err(ToolError::invalid(format!(
                            "missing required parameter '{}'",
                            spec.name
                        )));
                    }
                }
            }
        }
        Ok(Args { values })
    }

    /// JSON-Schema object advertised to callers.
    pub fn to_json(&self) -> Value {
        let properties: Map<String, Value> = self
            .params
            .iter()
            .map(|p| (p.name.to_string(), p.to_json()))
            .collect();
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name)
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }
}

/// Arguments that passed validation, with defaults applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    values: Map<String, Value>,
}

impl Args {
    fn missing(name: &str) -> ToolError {
        ToolError::internal(format!("parameter '{name}' missing after validation"))
    }

    pub fn str(&self, name: &str) -> Result<&str, ToolError> {
        self.values
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| Self::missing(name))
    }

    /// Absent and empty strings both read as `None`.
    pub fn opt_str(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn int(&self, name: &str) -> Result<i64, ToolError> {
        self.values
            .get(name)
            .and_then(Value::as_i64)
            .ok_or_else(|| Self::missing(name))
    }

    pub fn bool(&self, name: &str) -> Result<bool, ToolError> {
        self.values
            .get(name)
            .and_then(Value::as_bool)
            .ok_or_else(|| Self::missing(name))
    }

    pub fn str_list(&self, name: &str) -> Result<Vec<String>, ToolError> {
        let items = self
            .values
            .get(name)
            .and_then(Value::as_array)
            .ok_or_else(|| Self::missing(name))?;
        Ok(items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect())
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn schema() -> ParamSchema {
        ParamSchema::new()
            .param(ParamSpec::string("host", "Target").required().min(1).max(10))
            .param(ParamSpec::integer("count", "Packets").range(1, 10).default(4))
            .param(ParamSpec::string("mode", "Mode").one_of(&["tcp", "udp"]).default("tcp"))
            .param(ParamSpec::string_list("flags", "Flags").one_of(&["-v", "-n"]))
            .param(ParamSpec::boolean("hidden", "Show hidden"))
    }

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn fills_defaults() {
        let parsed = schema().validate(&args(json!({"host": "a"}))).unwrap();
        assert_eq!(parsed.str("host").unwrap(), "a");
        assert_eq!(parsed.int("count").unwrap(), 4);
        assert_eq!(parsed.str("mode").unwrap(), "tcp");
        assert!(parsed.bool("hidden").is_err());
    }

    #[test]
    fn null_counts_as_absent() {
        let parsed = schema()
            .validate(&args(json!({"host": "a", "count": null})))
            .unwrap();
        assert_eq!(parsed.int("count").unwrap(), 4);
    }

    #[test]
    fn rejects_missing_required() {
        let err = schema().validate(&args(json!({}))).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert!(err.message.contains("host"));
    }

    #[test]
    fn rejects_unknown_parameters() {
        let err = schema()
            .validate(&args(json!({"host": "a", "options": "-oX /tmp/x"})))
            .unwrap_err();
        assert!(err.message.contains("unknown parameter 'options'"));
    }

    #[test]
    fn rejects_wrong_types() {
        assert!(schema().validate(&args(json!({"host": 5}))).is_err());
        assert!(schema()
            .validate(&args(json!({"host": "a", "count": "4"})))
            .is_err());
        assert!(schema()
            .validate(&args(json!({"host": "a", "hidden": "yes"})))
            .is_err());
    }

    #[test]
    fn enforces_bounds() {
        assert!(schema()
            .validate(&args(json!({"host": "a", "count": 11})))
            .is_err());
        assert!(schema()
            .validate(&args(json!({"host": "a", "count": 0})))
            .is_err());
        assert!(schema().validate(&args(json!({"host": ""}))).is_err());
        assert!(schema()
            .validate(&args(json!({"host": "abcdefghijk"})))
            .is_err());
    }

    #[test]
    fn enforces_allow_lists() {
        assert!(schema()
            .validate(&args(json!({"host": "a", "mode": "icmp"})))
            .is_err());
        assert!(schema()
            .validate(&args(json!({"host": "a", "flags": ["-v", "--script=evil"]})))
            .is_err());
        let ok = schema()
            .validate(&args(json!({"host": "a", "flags": ["-v", "-n"]})))
            .unwrap();
        assert_eq!(ok.str_list("flags").unwrap(), vec!["-v", "-n"]);
    }

    #[test]
    fn json_schema_shape() {
        let js = schema().to_json();
        assert_eq!(js["type"], "object");
        assert_eq!(js["required"], json!(["host"]));
        assert_eq!(js["additionalProperties"], false);
        assert_eq!(js["properties"]["count"]["maximum"], 10);
        assert_eq!(js["properties"]["count"]["default"], 4);
        assert_eq!(js["properties"]["mode"]["enum"], json!(["tcp", "udp"]));
        assert_eq!(js["properties"]["flags"]["items"]["enum"], json!(["-v", "-n"]));
        assert_eq!(js["properties"]["host"]["maxLength"], 10);
    }

    #[test]
    fn opt_str_treats_empty_as_absent() {
        let parsed = ParamSchema::new()
            .param(ParamSpec::string("user", "User").default(""))
            .validate(&Map::new())
            .unwrap();
        assert_eq!(parsed.opt_str("user"), None);
    }
}
