use std::sync::LazyLock;

static HOSTNAME: LazyLock<String> = LazyLock::new(|| {
    resolve(
        std::env::var("HOSTNAME").ok(),
        std::fs::read_to_string("/etc/hostname").ok(),
    )
});

fn resolve(env: Option<String>, file: Option<String>) -> String {
    [env, file]
        .into_iter()
        .flatten()
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| String::from("localhost"))
}

/// The name of the machine this process runs on.
///
/// Taken from `HOSTNAME`, then `/etc/hostname`, and finally `localhost`.
pub fn local() -> &'static str {
    HOSTNAME.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_environment() {
        assert_eq!(
            resolve(Some("mta1.example.com".into()), Some("box\n".into())),
            "mta1.example.com"
        );
    }

    #[test]
    fn falls_back_through_sources() {
        assert_eq!(resolve(Some("  ".into()), Some("box\n".into())), "box");
        assert_eq!(resolve(None, None), "localhost");
    }
}
