//! Key-path arithmetic shared by both backend generations.

/// Join a namespace and an entry name into a store key.
///
/// Preserves the caller's rooting convention: a namespace with a leading
/// slash yields a rooted key, one without stays relative.
pub(crate) fn join(namespace: &str, name: &str) -> String {
    format!(
        "{}/{}",
        namespace.trim_end_matches('/'),
        name.trim_start_matches('/')
    )
}

/// The prefix covering every entry under `namespace`.
///
/// The trailing slash keeps a prefix scan on `svc` from matching entries
/// of a sibling namespace such as `svc2`.
pub(crate) fn prefix(namespace: &str) -> String {
    format!("{}/", namespace.trim_end_matches('/'))
}

/// Compute an entry name relative to its namespace.
///
/// Returns `None` when `key` does not live under `namespace`, or when the
/// remainder is empty (the namespace node itself).
pub(crate) fn relative<'a>(namespace: &str, key: &'a str) -> Option<&'a str> {
    let namespace = namespace.trim_matches('/');
    let key = key.trim_start_matches('/');
    if namespace.is_empty() {
        return (!key.is_empty()).then_some(key);
    }
    let rest = key.strip_prefix(namespace)?.strip_prefix('/')?;
    (!rest.is_empty()).then_some(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_handles_rooted_and_relative_namespaces() {
        assert_eq!(join("svc", "worker-1"), "svc/worker-1");
        assert_eq!(join("/svc", "worker-1"), "/svc/worker-1");
        assert_eq!(join("svc/", "worker-1"), "svc/worker-1");
        assert_eq!(join("/svc", "/worker-1"), "/svc/worker-1");
    }

    #[test]
    fn prefix_always_ends_with_one_slash() {
        assert_eq!(prefix("svc"), "svc/");
        assert_eq!(prefix("svc/"), "svc/");
        assert_eq!(prefix("/svc"), "/svc/");
    }

    #[test]
    fn relative_strips_the_namespace() {
        assert_eq!(relative("svc", "/svc/worker-1"), Some("worker-1"));
        assert_eq!(relative("/svc", "svc/worker-1"), Some("worker-1"));
        assert_eq!(relative("svc", "svc/a/b"), Some("a/b"));
    }

    #[test]
    fn relative_rejects_foreign_keys() {
        assert_eq!(relative("svc", "/other/worker-1"), None);
        // sibling namespace sharing the prefix bytes
        assert_eq!(relative("svc", "/svc2/worker-1"), None);
    }

    #[test]
    fn relative_rejects_the_namespace_node_itself() {
        assert_eq!(relative("svc", "/svc"), None);
        assert_eq!(relative("svc", "/svc/"), None);
    }

    #[test]
    fn empty_namespace_yields_the_whole_key() {
        assert_eq!(relative("", "/svc/worker-1"), Some("svc/worker-1"));
    }
}
