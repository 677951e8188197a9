use regex::Regex;

use crate::object::{CdsItem, MetadataField};

/// One configured `mime-prefix -> upnp class` rule with an optional
/// conjunction of filter predicates over item fields.
#[derive(Debug, Clone)]
pub struct UpnpMap {
    pub mime_type: String,
    pub upnp_class: String,
    filters: Vec<(String, String, String)>,
}

impl UpnpMap {
    pub fn new(
        mime_type: impl Into<String>,
        upnp_class: impl Into<String>,
        filters: Vec<(String, String, String)>,
    ) -> Self {
        Self {
            mime_type: mime_type.into(),
            upnp_class: upnp_class.into(),
            filters,
        }
    }

    /// Parse configured patterns, keeping their order. A pattern key is
    /// `mime[;field(op)value…]`; `type/*` prefixes match on `type/`.
    pub fn init_map(source: &[(String, String)]) -> Vec<UpnpMap> {
        let filter_re = Regex::new("^([A-Za-z0-9_:]+)(==|!=|<|>|=)([A-Za-z0-9_]+)$").unwrap();
        let mut target = Vec::with_capacity(source.len());
        for (key, upnp_class) in source {
            let mut parts = key.split(';');
            let mut mime = parts.next().unwrap_or_default().to_string();
            if let Some((primary, sub)) = mime.clone().split_once('/') {
                if sub == "*" {
                    mime = format!("{primary}/");
                }
            }
            let mut filters = Vec::new();
            for filter in parts {
                if let Some(captures) = filter_re.captures(filter) {
                    filters.push((
                        captures[1].to_string(),
                        captures[2].to_string(),
                        captures[3].to_string(),
                    ));
                }
            }
            target.push(UpnpMap::new(mime, upnp_class.clone(), filters));
        }
        target
    }

    fn check_str(op: &str, expect: &str, actual: &str) -> bool {
        match op {
            "=" | "==" => actual.contains(expect),
            "!=" => !actual.contains(expect),
            "<" => actual < expect,
            ">" => actual > expect,
            _ => false,
        }
    }

    fn check_int(op: &str, expect: i32, actual: i32) -> bool {
        match op {
            "=" | "==" => actual == expect,
            "!=" => actual != expect,
            "<" => actual < expect,
            ">" => actual > expect,
            _ => false,
        }
    }

    /// Evaluate the rule against an item. All filters must pass; a rule
    /// without filters matches on mime prefix alone.
    pub fn is_match(&self, item: &CdsItem, mime_type: &str) -> bool {
        if !mime_type.starts_with(&self.mime_type) {
            return false;
        }
        self.filters.iter().all(|(field, op, expect)| {
            match field.as_str() {
                "location" => Self::check_str(
                    op,
                    expect,
                    &item.core.location.to_string_lossy(),
                ),
                "tracknumber" => {
                    Self::check_int(op, expect.parse().unwrap_or(0), item.track_number)
                }
                "partnumber" => Self::check_int(op, expect.parse().unwrap_or(0), item.part_number),
                _ => {
                    let actual = MetadataField::from_tag(field)
                        .and_then(|f| item.core.meta(f))
                        .or_else(|| item.core.meta_raw(field))
                        .unwrap_or_default();
                    Self::check_str(op, expect, actual)
                }
            }
        })
    }
}
