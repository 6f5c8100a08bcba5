use std::borrow::Cow;

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref COMMA: Regex = Regex::new(r"\s*,\s*").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref INVALID: Regex = Regex::new(r"[^a-zA-Z0-9._]+").unwrap();
    static ref DOTS: Regex = Regex::new(r"\.+").unwrap();
    static ref UNDERSCORES: Regex = Regex::new(r"_+").unwrap();
}

/// Prefix of JVM metric names, which keep their own naming scheme.
const JVM_PREFIX: &str = "jvm";

/// Normalizes a metric name into the lowercase, dot separated, snake_case form used on
/// the wire.
///
/// `org.apache.cassandra.metrics.ClientRequest.Latency` becomes
/// `org.apache.cassandra.metrics.client_request.latency`.
pub fn clean(name: &str) -> String {
    if name.starts_with(JVM_PREFIX) {
        return name.replace(['-', '/'], "_").to_lowercase();
    }

    let name = COMMA.replace_all(name, ",");
    let name = WHITESPACE.replace_all(&name, "_");
    let name = name.replace(['\\', '/'], "_");
    let name = INVALID.replace_all(&name, ".");
    let name = DOTS.replace_all(&name, ".");
    let name = UNDERSCORES.replace_all(&name, "_");

    let name = split_camel_case(&name).replace("._", ".");
    let name: Cow<'_, str> = UNDERSCORES.replace_all(&name, "_");
    name.to_lowercase()
}

/// Joins camelCase words with underscores. A boundary sits before an uppercase letter
/// that follows a non uppercase character, and before an uppercase letter followed by a
/// lowercase one (`HTTPServer` -> `HTTP_Server`).
fn split_camel_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 8);
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && c.is_ascii_uppercase() {
            let after_non_upper = !chars[i - 1].is_ascii_uppercase();
            let starts_word = chars.get(i + 1).is_some_and(|next| next.is_ascii_lowercase());
            if after_non_upper || starts_word {
                out.push('_');
            }
        }
        out.push(*c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camel_case_segments_become_snake_case() {
        assert_eq!(
            clean("org.apache.cassandra.metrics.ClientRequest.Latency.metric1"),
            "org.apache.cassandra.metrics.client_request.latency.metric1"
        );
        assert_eq!(clean("ThreadPools.ActiveTasks"), "thread_pools.active_tasks");
        assert_eq!(clean("HTTPServer"), "http_server");
    }

    #[test]
    fn separators_and_invalid_characters() {
        assert_eq!(clean("a b\\c/d"), "a_b_c_d");
        assert_eq!(clean("keyspace:table..count"), "keyspace.table.count");
        assert_eq!(clean("a , b"), "a.b");
        assert_eq!(clean("a__b"), "a_b");
    }

    #[test]
    fn jvm_names_skip_camel_case_conversion() {
        assert_eq!(clean("jvm.gc.G1-Young-Generation.count"), "jvm.gc.g1_young_generation.count");
        assert_eq!(clean("jvm.memory/heapUsed"), "jvm.memory_heapused");
    }
}
