//! Port recovery for restarted dev servers
//!
//! Dev servers rarely come back on the same port. When a mapping carries a
//! process identifier (workdir plus optional command pattern), the live
//! process snapshot is consulted on every use and the stored port is only
//! a fallback.

use crate::discovery::ProcessRecord;
use crate::store::ProcessIdentifier;
use regex::Regex;

/// Find the current port for the identified process, or `None` when no
/// listening process matches (the caller falls back to the stored port).
///
/// With several matching candidates the lowest port wins: multi-port dev
/// servers put the app below their HMR/debug listeners.
pub fn resolve_port(identifier: &ProcessIdentifier, records: &[ProcessRecord]) -> Option<u16> {
    if identifier.workdir.is_empty() {
        return None;
    }

    records
        .iter()
        .filter(|r| match_workdir(&r.workdir, &identifier.workdir))
        .filter(|r| match identifier.command_pattern.as_deref() {
            Some(pattern) => matches_command(r, pattern),
            None => true,
        })
        .map(|r| r.port)
        .min()
}

/// Workdirs match when equal or when either is a subdirectory of the
/// other. Dev tools often report the app root while the judge remembered
/// the repo root, or vice versa.
pub fn match_workdir(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    let a = a.trim_end_matches('/');
    let b = b.trim_end_matches('/');
    a == b || a.starts_with(&format!("{b}/")) || b.starts_with(&format!("{a}/"))
}

/// Match the pattern against command or args as a regex; an invalid regex
/// degrades to a literal substring check.
fn matches_command(record: &ProcessRecord, pattern: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(&record.command) || re.is_match(&record.args),
        Err(_) => record.command.contains(pattern) || record.args.contains(pattern),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(port: u16, workdir: &str, command: &str, args: &str) -> ProcessRecord {
        ProcessRecord {
            port,
            pid: port as i32,
            ppid: 1,
            bind_address: "127.0.0.1".to_string(),
            command: command.to_string(),
            args: args.to_string(),
            workdir: workdir.to_string(),
        }
    }

    fn identifier(workdir: &str, pattern: Option<&str>) -> ProcessIdentifier {
        ProcessIdentifier {
            workdir: workdir.to_string(),
            command_pattern: pattern.map(String::from),
        }
    }

    #[test]
    fn test_match_workdir() {
        assert!(match_workdir("/home/u/app", "/home/u/app"));
        assert!(match_workdir("/home/u/app/", "/home/u/app"));
        assert!(match_workdir("/home/u/app/frontend", "/home/u/app"));
        assert!(match_workdir("/home/u/app", "/home/u/app/frontend"));
        assert!(!match_workdir("/home/u/appetite", "/home/u/app"));
        assert!(!match_workdir("", "/home/u/app"));
        assert!(!match_workdir("/home/u/app", ""));
    }

    #[test]
    fn test_resolve_port_subdirectory_match() {
        // The judge stored the repo root; vite reports the frontend dir.
        let records = vec![record(5174, "/home/u/app/frontend", "node", "vite")];
        let port = resolve_port(&identifier("/home/u/app", None), &records);
        assert_eq!(port, Some(5174));
    }

    #[test]
    fn test_resolve_port_prefers_lowest() {
        let records = vec![
            record(5174, "/home/u/app", "node", "vite --hmr"),
            record(5173, "/home/u/app", "node", "vite"),
        ];
        assert_eq!(resolve_port(&identifier("/home/u/app", None), &records), Some(5173));
    }

    #[test]
    fn test_resolve_port_no_candidates() {
        let records = vec![record(3000, "/home/u/other", "node", "next dev")];
        assert_eq!(resolve_port(&identifier("/home/u/app", None), &records), None);
        assert_eq!(resolve_port(&identifier("", None), &records), None);
    }

    #[test]
    fn test_command_pattern_filters() {
        let records = vec![
            record(8080, "/home/u/app", "python3", "manage.py runserver"),
            record(5173, "/home/u/app", "node", "vite"),
        ];
        let port = resolve_port(&identifier("/home/u/app", Some("runserver")), &records);
        assert_eq!(port, Some(8080));
    }

    #[test]
    fn test_invalid_regex_falls_back_to_substring() {
        let records = vec![record(5173, "/home/u/app", "node", "vite [dev")];
        // "[dev" is not a valid regex but is a literal substring of args.
        let port = resolve_port(&identifier("/home/u/app", Some("[dev")), &records);
        assert_eq!(port, Some(5173));
    }

    #[test]
    fn test_same_candidates_same_port() {
        let snapshot_a = vec![
            record(5174, "/home/u/app", "node", "vite"),
            record(5173, "/home/u/app", "node", "vite"),
        ];
        let snapshot_b = snapshot_a.clone();
        let id = identifier("/home/u/app", None);
        assert_eq!(resolve_port(&id, &snapshot_a), resolve_port(&id, &snapshot_b));
    }
}
