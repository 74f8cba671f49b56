/// Version line shown by `--version`.
///
/// Release builds may stamp `CHECK_BY_POWERSHELL_COMMIT`,
/// `CHECK_BY_POWERSHELL_DATE` and `CHECK_BY_POWERSHELL_BUILT_BY` into the
/// binary at compile time.
pub fn build_version() -> String {
    compose(
        env!("CARGO_PKG_VERSION"),
        option_env!("CHECK_BY_POWERSHELL_COMMIT"),
        option_env!("CHECK_BY_POWERSHELL_DATE"),
        option_env!("CHECK_BY_POWERSHELL_BUILT_BY"),
    )
}

fn compose(
    version: &str,
    commit: Option<&str>,
    date: Option<&str>,
    built_by: Option<&str>,
) -> String {
    fn present(value: Option<&str>) -> Option<&str> {
        value.filter(|value| !value.is_empty())
    }

    let mut line = version.to_string();

    if let Some(commit) = present(commit) {
        line.push_str(&format!(" - {commit}"));
    }
    if let Some(date) = present(date) {
        line.push_str(&format!(" ({date})"));
    }
    if let Some(built_by) = present(built_by) {
        line.push_str(&format!(" (built by {built_by})"));
    }

    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_version() {
        assert_eq!(compose("0.2.0", None, None, None), "0.2.0");
        assert_eq!(compose("0.2.0", Some(""), Some(""), None), "0.2.0");
    }

    #[test]
    fn stamped_version() {
        assert_eq!(
            compose(
                "0.2.0",
                Some("a1b2c3d"),
                Some("2021-03-04T10:00:00Z"),
                Some("goreleaser")
            ),
            "0.2.0 - a1b2c3d (2021-03-04T10:00:00Z) (built by goreleaser)"
        );
        assert_eq!(compose("0.2.0", None, Some("today"), None), "0.2.0 (today)");
    }

    #[test]
    fn package_version_leads() {
        assert!(build_version().starts_with(env!("CARGO_PKG_VERSION")));
    }
}
