use std::num::NonZeroU64;

use regex::escape;
use serde_json::json;
use serde_json::Value;

use crate::error::SchemaError;
use crate::json_schema::types;

type Result<T> = std::result::Result<T, SchemaError>;

/// Recursive-descent compiler from a JSON Schema value to a regex string.
///
/// Dispatch is keyed on which schema keywords are present, in a fixed
/// priority: `properties`, `allOf`, `anyOf`, `oneOf`, `prefixItems`,
/// `enum`, `const`, `$ref`, `type`. An empty object is unconstrained and
/// compiles to the union of every JSON type.
pub(crate) struct Compiler<'a> {
    root: &'a Value,
    whitespace_pattern: &'a str,
    recursion_depth: usize,
    max_recursion_depth: usize,
}

impl<'a> Compiler<'a> {
    // The default recursion ceiling is deliberately low. Each extra level
    // multiplies the regex size of a self-referential schema; level 5 of a
    // simple recursive schema already produces patterns past 700K bytes and
    // trips the regex crate's compiled-size limit.
    const DEFAULT_MAX_RECURSION_DEPTH: usize = 3;

    pub fn new(root: &'a Value) -> Self {
        Self {
            root,
            whitespace_pattern: types::WHITESPACE,
            recursion_depth: 0,
            max_recursion_depth: Self::DEFAULT_MAX_RECURSION_DEPTH,
        }
    }

    pub fn with_whitespace_pattern(self, whitespace_pattern: &'a str) -> Self {
        Self {
            whitespace_pattern,
            ..self
        }
    }

    pub fn with_max_recursion_depth(self, max_recursion_depth: usize) -> Self {
        Self {
            max_recursion_depth,
            ..self
        }
    }

    pub fn compile(&mut self, schema: &Value) -> Result<String> {
        match schema {
            Value::Object(obj) if obj.is_empty() => self.compile_unconstrained(),
            Value::Object(obj) if obj.contains_key("properties") => self.compile_properties(obj),
            Value::Object(obj) if obj.contains_key("allOf") => self.compile_all_of(obj),
            Value::Object(obj) if obj.contains_key("anyOf") => self.compile_any_of(obj),
            Value::Object(obj) if obj.contains_key("oneOf") => self.compile_one_of(obj),
            Value::Object(obj) if obj.contains_key("prefixItems") => self.compile_prefix_items(obj),
            Value::Object(obj) if obj.contains_key("enum") => self.compile_enum(obj),
            Value::Object(obj) if obj.contains_key("const") => self.compile_const(obj),
            Value::Object(obj) if obj.contains_key("$ref") => self.compile_ref(obj),
            Value::Object(obj) if obj.contains_key("type") => self.compile_type(obj),
            schema => Err(SchemaError::UnsupportedSchema(Box::new(schema.clone()))),
        }
    }

    fn compile_unconstrained(&mut self) -> Result<String> {
        // An empty schema places no constraint, so any JSON type is legal.
        let legal_types = [
            json!({"type": "boolean"}),
            json!({"type": "null"}),
            json!({"type": "number"}),
            json!({"type": "integer"}),
            json!({"type": "string"}),
            json!({"type": "array"}),
            json!({"type": "object"}),
        ];
        let mut alternatives = Vec::with_capacity(legal_types.len());
        for ty in &legal_types {
            alternatives.push(format!("({})", self.compile(ty)?));
        }
        Ok(alternatives.join("|"))
    }

    fn compile_properties(&mut self, obj: &serde_json::Map<String, Value>) -> Result<String> {
        let mut regex = String::from(r"\{");

        let properties = obj
            .get("properties")
            .and_then(Value::as_object)
            .ok_or(SchemaError::PropertiesNotFound)?;

        let required: Vec<&str> = obj
            .get("required")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let is_required: Vec<bool> = properties
            .keys()
            .map(|name| required.contains(&name.as_str()))
            .collect();

        if is_required.iter().any(|&x| x) {
            // Commas are placed so every required property appears exactly
            // once while any subset of the optional ones may appear:
            // properties before the last required one carry a trailing
            // comma, properties after it a leading one.
            let last_required_pos = is_required
                .iter()
                .enumerate()
                .filter(|&(_, &required)| required)
                .map(|(i, _)| i)
                .max()
                .unwrap();

            for (i, (name, value)) in properties.iter().enumerate() {
                let mut subregex =
                    format!(r#"{0}"{1}"{0}:{0}"#, self.whitespace_pattern, escape(name));
                subregex += &match self.compile(value) {
                    Ok(regex) => regex,
                    Err(e) if e.is_recursion_limit() && !is_required[i] => continue,
                    Err(e) => return Err(e),
                };
                match i {
                    i if i < last_required_pos => {
                        subregex = format!("{}{},", subregex, self.whitespace_pattern)
                    }
                    i if i > last_required_pos => {
                        subregex = format!("{},{}", self.whitespace_pattern, subregex)
                    }
                    _ => (),
                }
                regex += &if is_required[i] {
                    subregex
                } else {
                    format!("({})?", subregex)
                };
            }
        } else {
            // Nothing is required: the object may be empty, or hold any
            // prefix-closed subset of the properties in declaration order.
            let mut property_subregexes = Vec::new();
            for (name, value) in properties.iter() {
                let mut subregex =
                    format!(r#"{0}"{1}"{0}:{0}"#, self.whitespace_pattern, escape(name));
                subregex += &match self.compile(value) {
                    Ok(regex) => regex,
                    Err(e) if e.is_recursion_limit() => continue,
                    Err(e) => return Err(e),
                };
                property_subregexes.push(subregex);
            }

            let mut possible_patterns = Vec::new();
            for i in 0..property_subregexes.len() {
                let mut pattern = String::new();
                for subregex in &property_subregexes[..i] {
                    pattern += &format!("({}{},)?", subregex, self.whitespace_pattern);
                }
                pattern += &property_subregexes[i];
                for subregex in &property_subregexes[i + 1..] {
                    pattern += &format!("({},{})?", self.whitespace_pattern, subregex);
                }
                possible_patterns.push(pattern);
            }

            regex += &format!("({})?", possible_patterns.join("|"));
        }

        regex += &format!("{}\\}}", self.whitespace_pattern);
        Ok(regex)
    }

    fn compile_all_of(&mut self, obj: &serde_json::Map<String, Value>) -> Result<String> {
        match obj.get("allOf") {
            Some(Value::Array(all_of)) if !all_of.is_empty() => {
                let subregexes: Result<Vec<String>> =
                    all_of.iter().map(|sub| self.compile(sub)).collect();
                Ok(format!(r"({})", subregexes?.join("")))
            }
            _ => Err(SchemaError::AllOfMustBeAnArray),
        }
    }

    fn compile_any_of(&mut self, obj: &serde_json::Map<String, Value>) -> Result<String> {
        match obj.get("anyOf") {
            Some(Value::Array(any_of)) if !any_of.is_empty() => {
                let mut subregexes = Vec::with_capacity(any_of.len());
                for sub in any_of {
                    match self.compile(sub) {
                        Ok(regex) => subregexes.push(regex),
                        // A branch that recurses past the ceiling is elided;
                        // the alternation survives as long as one branch does.
                        Err(e) if e.is_recursion_limit() => continue,
                        Err(e) => return Err(e),
                    }
                }
                if subregexes.is_empty() {
                    return Err(SchemaError::RefRecursionLimit(self.max_recursion_depth));
                }
                Ok(format!(r"({})", subregexes.join("|")))
            }
            _ => Err(SchemaError::AnyOfMustBeAnArray),
        }
    }

    fn compile_one_of(&mut self, obj: &serde_json::Map<String, Value>) -> Result<String> {
        match obj.get("oneOf") {
            Some(Value::Array(one_of)) if !one_of.is_empty() => {
                let subregexes: Result<Vec<String>> =
                    one_of.iter().map(|sub| self.compile(sub)).collect();
                let xor_patterns: Vec<String> = subregexes?
                    .into_iter()
                    .map(|subregex| format!(r"(?:{})", subregex))
                    .collect();
                Ok(format!(r"({})", xor_patterns.join("|")))
            }
            _ => Err(SchemaError::OneOfMustBeAnArray),
        }
    }

    fn compile_prefix_items(&mut self, obj: &serde_json::Map<String, Value>) -> Result<String> {
        match obj.get("prefixItems") {
            Some(Value::Array(prefix_items)) => {
                let element_patterns: Result<Vec<String>> =
                    prefix_items.iter().map(|sub| self.compile(sub)).collect();

                let comma_split_pattern = format!("{0},{0}", self.whitespace_pattern);
                let tuple_inner = element_patterns?.join(&comma_split_pattern);

                Ok(format!(r"\[{0}{tuple_inner}{0}\]", self.whitespace_pattern))
            }
            _ => Err(SchemaError::PrefixItemsMustBeAnArray),
        }
    }

    fn compile_enum(&mut self, obj: &serde_json::Map<String, Value>) -> Result<String> {
        match obj.get("enum") {
            Some(Value::Array(enum_values)) => {
                let choices: Result<Vec<String>> = enum_values
                    .iter()
                    .map(|choice| self.compile_literal_value(choice))
                    .collect();
                Ok(format!(r"({})", choices?.join("|")))
            }
            _ => Err(SchemaError::EnumMustBeAnArray),
        }
    }

    fn compile_const(&mut self, obj: &serde_json::Map<String, Value>) -> Result<String> {
        match obj.get("const") {
            Some(const_value) => self.compile_literal_value(const_value),
            None => Err(SchemaError::ConstKeyNotFound),
        }
    }

    /// A literal JSON value as a regex: scalars are stringified then
    /// regex-escaped; containers expand recursively so their whitespace
    /// stays conformant with the whitespace pattern.
    fn compile_literal_value(&mut self, value: &Value) -> Result<String> {
        match value {
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
                let json_string = serde_json::to_string(value)?;
                Ok(escape(&json_string))
            }
            Value::Array(items) => {
                let inner: Result<Vec<String>> = items
                    .iter()
                    .map(|item| self.compile_literal_value(item))
                    .collect();
                Ok(format!(
                    r"\[{0}{1}{0}\]",
                    self.whitespace_pattern,
                    inner?.join(&format!("{0},{0}", self.whitespace_pattern))
                ))
            }
            Value::Object(members) => {
                let inner: Result<Vec<String>> = members
                    .iter()
                    .map(|(key, member)| {
                        let key_pattern =
                            self.compile_literal_value(&Value::String(key.clone()))?;
                        let member_pattern = self.compile_literal_value(member)?;
                        Ok(format!(
                            "{}{}:{}{}",
                            key_pattern,
                            self.whitespace_pattern,
                            self.whitespace_pattern,
                            member_pattern
                        ))
                    })
                    .collect();
                Ok(format!(
                    r"\{{{0}{1}{0}\}}",
                    self.whitespace_pattern,
                    inner?.join(&format!("{0},{0}", self.whitespace_pattern))
                ))
            }
        }
    }

    fn compile_ref(&mut self, obj: &serde_json::Map<String, Value>) -> Result<String> {
        if self.recursion_depth > self.max_recursion_depth {
            return Err(SchemaError::RefRecursionLimit(self.max_recursion_depth));
        }
        self.recursion_depth += 1;
        let result = self.compile_ref_inner(obj);
        self.recursion_depth -= 1;
        result
    }

    fn compile_ref_inner(&mut self, obj: &serde_json::Map<String, Value>) -> Result<String> {
        let ref_path = obj["$ref"].as_str().ok_or(SchemaError::RefMustBeAString)?;

        let parts: Vec<&str> = ref_path.split('#').collect();
        match parts.as_slice() {
            [fragment] | ["", fragment] => {
                let path_parts: Vec<&str> =
                    fragment.split('/').filter(|s| !s.is_empty()).collect();
                let referenced = Self::resolve_local_ref(self.root, &path_parts)?;
                self.compile(referenced)
            }
            [base, fragment] => {
                if let Some(id) = self.root["$id"].as_str() {
                    if *base == id || base.is_empty() {
                        let path_parts: Vec<&str> =
                            fragment.split('/').filter(|s| !s.is_empty()).collect();
                        let referenced = Self::resolve_local_ref(self.root, &path_parts)?;
                        return self.compile(referenced);
                    }
                }
                Err(SchemaError::ExternalReference(Box::from(ref_path)))
            }
            _ => Err(SchemaError::InvalidReferenceFormat(Box::from(ref_path))),
        }
    }

    fn compile_type(&mut self, obj: &serde_json::Map<String, Value>) -> Result<String> {
        match &obj["type"] {
            Value::String(instance_type) => self.compile_named_type(instance_type, obj),
            // A type array is an untagged union over the named types.
            Value::Array(types) => {
                let subregexes: Result<Vec<String>> = types
                    .iter()
                    .map(|ty| match ty.as_str() {
                        Some(name) => {
                            let single = json!({ "type": name });
                            Ok(format!(r"(?:{})", self.compile(&single)?))
                        }
                        None => Err(SchemaError::TypeMustBeAString),
                    })
                    .collect();
                Ok(format!(r"({})", subregexes?.join("|")))
            }
            _ => Err(SchemaError::TypeMustBeAString),
        }
    }

    fn compile_named_type(
        &mut self,
        instance_type: &str,
        obj: &serde_json::Map<String, Value>,
    ) -> Result<String> {
        match instance_type {
            "string" => self.compile_string_type(obj),
            "number" => self.compile_number_type(obj),
            "integer" => self.compile_integer_type(obj),
            "array" => self.compile_array_type(obj),
            "object" => self.compile_object_type(obj),
            "boolean" => Ok(types::JsonType::Boolean.to_regex().to_string()),
            "null" => Ok(types::JsonType::Null.to_regex().to_string()),
            _ => Err(SchemaError::UnsupportedType(Box::from(instance_type))),
        }
    }

    fn compile_string_type(&mut self, obj: &serde_json::Map<String, Value>) -> Result<String> {
        if obj.contains_key("maxLength") || obj.contains_key("minLength") {
            let max_length = obj.get("maxLength");
            let min_length = obj.get("minLength");

            if let (Some(min), Some(max)) = (min_length, max_length) {
                if min.as_f64() > max.as_f64() {
                    return Err(SchemaError::MaxBound);
                }
            }

            let formatted_max = max_length
                .and_then(Value::as_u64)
                .map_or(String::new(), |n| n.to_string());
            let formatted_min = min_length
                .and_then(Value::as_u64)
                .map_or("0".to_string(), |n| n.to_string());

            Ok(format!(
                r#""{}{{{},{}}}""#,
                types::STRING_INNER,
                formatted_min,
                formatted_max,
            ))
        } else if let Some(pattern) = obj.get("pattern").and_then(Value::as_str) {
            // The pattern constrains the string's content; anchors are
            // redundant once the body is wrapped in quotes.
            if pattern.starts_with('^') && pattern.ends_with('$') {
                Ok(format!(r#"("{}")"#, &pattern[1..pattern.len() - 1]))
            } else {
                Ok(format!(r#"("{}")"#, pattern))
            }
        } else if let Some(format) = obj.get("format").and_then(Value::as_str) {
            match types::FormatType::from_str(format) {
                Some(format_type) => Ok(format_type.to_regex().to_string()),
                None => Err(SchemaError::UnsupportedFormat(Box::from(format))),
            }
        } else {
            Ok(types::JsonType::String.to_regex().to_string())
        }
    }

    fn compile_number_type(&mut self, obj: &serde_json::Map<String, Value>) -> Result<String> {
        let bounds = [
            "minDigitsInteger",
            "maxDigitsInteger",
            "minDigitsFraction",
            "maxDigitsFraction",
            "minDigitsExponent",
            "maxDigitsExponent",
        ];

        if !bounds.iter().any(|&key| obj.contains_key(key)) {
            return Ok(types::JsonType::Number.to_regex().to_string());
        }

        let (min_digits_integer, max_digits_integer) = Self::validate_quantifiers(
            obj.get("minDigitsInteger").and_then(Value::as_u64),
            obj.get("maxDigitsInteger").and_then(Value::as_u64),
            1,
        )?;
        let (min_digits_fraction, max_digits_fraction) = Self::validate_quantifiers(
            obj.get("minDigitsFraction").and_then(Value::as_u64),
            obj.get("maxDigitsFraction").and_then(Value::as_u64),
            0,
        )?;
        let (min_digits_exponent, max_digits_exponent) = Self::validate_quantifiers(
            obj.get("minDigitsExponent").and_then(Value::as_u64),
            obj.get("maxDigitsExponent").and_then(Value::as_u64),
            0,
        )?;

        let integers_quantifier = match (min_digits_integer, max_digits_integer) {
            (Some(min), Some(max)) => format!("{{{},{}}}", min, max),
            (Some(min), None) => format!("{{{},}}", min),
            (None, Some(max)) => format!("{{1,{}}}", max),
            (None, None) => "*".to_string(),
        };
        let fraction_quantifier = match (min_digits_fraction, max_digits_fraction) {
            (Some(min), Some(max)) => format!("{{{},{}}}", min, max),
            (Some(min), None) => format!("{{{},}}", min),
            (None, Some(max)) => format!("{{0,{}}}", max),
            (None, None) => "+".to_string(),
        };
        let exponent_quantifier = match (min_digits_exponent, max_digits_exponent) {
            (Some(min), Some(max)) => format!("{{{},{}}}", min, max),
            (Some(min), None) => format!("{{{},}}", min),
            (None, Some(max)) => format!("{{0,{}}}", max),
            (None, None) => "+".to_string(),
        };

        Ok(format!(
            r"((-)?(0|[1-9][0-9]{}))(\.[0-9]{})?([eE][+-][0-9]{})?",
            integers_quantifier, fraction_quantifier, exponent_quantifier
        ))
    }

    fn compile_integer_type(&mut self, obj: &serde_json::Map<String, Value>) -> Result<String> {
        if obj.contains_key("minDigits") || obj.contains_key("maxDigits") {
            let (min_digits, max_digits) = Self::validate_quantifiers(
                obj.get("minDigits").and_then(Value::as_u64),
                obj.get("maxDigits").and_then(Value::as_u64),
                1,
            )?;

            let quantifier = match (min_digits, max_digits) {
                (Some(min), Some(max)) => format!("{{{},{}}}", min, max),
                (Some(min), None) => format!("{{{},}}", min),
                (None, Some(max)) => format!("{{0,{}}}", max),
                (None, None) => "*".to_string(),
            };

            Ok(format!(r"(-)?(0|[1-9][0-9]{})", quantifier))
        } else {
            Ok(types::JsonType::Integer.to_regex().to_string())
        }
    }

    fn compile_object_type(&mut self, obj: &serde_json::Map<String, Value>) -> Result<String> {
        let min_properties = obj.get("minProperties").and_then(Value::as_u64);
        let max_properties = obj.get("maxProperties").and_then(Value::as_u64);

        let num_repeats = Self::repetition_bounds(min_properties, max_properties);

        if num_repeats.is_none() {
            return Ok(format!(r"\{{{}\}}", self.whitespace_pattern));
        }

        let allow_empty = if min_properties.unwrap_or(0) == 0 {
            "?"
        } else {
            ""
        };

        let value_pattern = match obj.get("additionalProperties") {
            None | Some(&Value::Bool(true)) => {
                // Unconstrained member values: any scalar, and containers up
                // to a bounded nesting depth so the pattern stays finite.
                let mut legal_types = vec![
                    json!({"type": "string"}),
                    json!({"type": "number"}),
                    json!({"type": "boolean"}),
                    json!({"type": "null"}),
                ];

                let depth = obj.get("depth").and_then(Value::as_u64).unwrap_or(2);
                if depth > 0 {
                    legal_types.push(json!({"type": "object", "depth": depth - 1}));
                    legal_types.push(json!({"type": "array", "depth": depth - 1}));
                }

                self.compile(&json!({"anyOf": legal_types}))?
            }
            Some(value_schema) => self.compile(value_schema)?,
        };

        let key_value_pattern = format!(
            "{}{1}:{1}{value_pattern}",
            types::STRING,
            self.whitespace_pattern,
        );
        let key_value_successor_pattern =
            format!("{0},{0}{key_value_pattern}", self.whitespace_pattern);
        let multiple_key_value_pattern =
            format!("({key_value_pattern}({key_value_successor_pattern}){{0,}}){allow_empty}");

        Ok(format!(
            r"\{{{0}{1}{0}\}}",
            self.whitespace_pattern, multiple_key_value_pattern
        ))
    }

    fn compile_array_type(&mut self, obj: &serde_json::Map<String, Value>) -> Result<String> {
        let num_repeats = Self::repetition_bounds(
            obj.get("minItems").and_then(Value::as_u64),
            obj.get("maxItems").and_then(Value::as_u64),
        )
        .unwrap_or_default();

        if num_repeats.is_empty() {
            return Ok(format!(r"\[{0}\]", self.whitespace_pattern));
        }

        let allow_empty = if obj.get("minItems").and_then(Value::as_u64).unwrap_or(0) == 0 {
            "?"
        } else {
            ""
        };

        if let Some(items) = obj.get("items") {
            let items_regex = self.compile(items)?;
            Ok(format!(
                r"\[{0}(({1})(,{0}({1})){2}){3}{0}\]",
                self.whitespace_pattern, items_regex, num_repeats, allow_empty
            ))
        } else {
            // No item schema: any scalar, and containers up to the bounded
            // nesting depth.
            let mut legal_types = vec![
                json!({"type": "boolean"}),
                json!({"type": "null"}),
                json!({"type": "number"}),
                json!({"type": "integer"}),
                json!({"type": "string"}),
            ];

            let depth = obj.get("depth").and_then(Value::as_u64).unwrap_or(2);
            if depth > 0 {
                legal_types.push(json!({"type": "object", "depth": depth - 1}));
                legal_types.push(json!({"type": "array", "depth": depth - 1}));
            }

            let regexes: Result<Vec<String>> =
                legal_types.iter().map(|ty| self.compile(ty)).collect();
            let regexes_joined = regexes?.join("|");

            Ok(format!(
                r"\[{0}(({1})(,{0}({1})){2}){3}{0}\]",
                self.whitespace_pattern, regexes_joined, num_repeats, allow_empty
            ))
        }
    }

    fn resolve_local_ref<'b>(schema: &'b Value, path_parts: &[&str]) -> Result<&'b Value> {
        let mut current = schema;
        for &part in path_parts {
            current = current
                .get(part)
                .ok_or_else(|| SchemaError::InvalidReferencePath(Box::from(part)))?;
        }
        Ok(current)
    }

    fn validate_quantifiers(
        min_bound: Option<u64>,
        max_bound: Option<u64>,
        start_offset: u64,
    ) -> Result<(Option<NonZeroU64>, Option<NonZeroU64>)> {
        let min_bound = min_bound.map(|n| NonZeroU64::new(n.saturating_sub(start_offset)));
        let max_bound = max_bound.map(|n| NonZeroU64::new(n.saturating_sub(start_offset)));

        if let (Some(min), Some(max)) = (min_bound, max_bound) {
            if max < min {
                return Err(SchemaError::MaxBound);
            }
        }

        Ok((min_bound.flatten(), max_bound.flatten()))
    }

    /// `{min-1,max-1}` repetition bounds on the successor pattern of a
    /// comma-separated list; `None` means the list is forced empty.
    fn repetition_bounds(min_items: Option<u64>, max_items: Option<u64>) -> Option<String> {
        let min_items = min_items.unwrap_or(0);

        match max_items {
            None => Some(format!("{{{},}}", min_items.saturating_sub(1))),
            Some(max_items) => {
                if max_items < 1 {
                    None
                } else {
                    Some(format!(
                        "{{{},{}}}",
                        min_items.saturating_sub(1),
                        max_items.saturating_sub(1)
                    ))
                }
            }
        }
    }
}
