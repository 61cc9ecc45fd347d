use std::path::{Path, PathBuf};
use shared::protocol::REPORT_EXTENSION;

const XML_OUTPUT: &str = "-oX";
const ALL_OUTPUT: &str = "-oA";
const RESUME: &str = "--resume";
const STDOUT: &str = "-";

/// Where the tee persists its copy of the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// New scan: create or truncate.
    Fresh(PathBuf),
    /// Resumed scan: append to the report the interrupted run left behind.
    Resume(PathBuf),
}

impl OutputTarget {
    pub fn path(&self) -> &Path {
        match self {
            OutputTarget::Fresh(path) | OutputTarget::Resume(path) => path,
        }
    }
}

/// Value following the first occurrence of `flag`.
pub fn find_argument<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

pub fn is_resume(args: &[String]) -> bool {
    find_argument(args, RESUME).is_some()
}

/// Resolve the file the tee writes to, if the invocation asks for one.
pub fn resolve_output_target(args: &[String]) -> Option<OutputTarget> {
    if let Some(resume) = find_argument(args, RESUME) {
        let path = Path::new(resume).with_extension(REPORT_EXTENSION);
        return Some(OutputTarget::Resume(path));
    }

    if let Some(output) = find_argument(args, XML_OUTPUT) {
        if output == STDOUT {
            return None;
        }
        return Some(OutputTarget::Fresh(PathBuf::from(output)));
    }

    find_argument(args, ALL_OUTPUT).map(|prefix| OutputTarget::Fresh(PathBuf::from(format!("{prefix}.{REPORT_EXTENSION}"))))
}

/// Arguments the scanner is actually spawned with.
///
/// The scanner always writes its XML report to stdout so the tee can observe
/// it; any report file the user asked for is produced by the tee instead.
/// Resumed scans replay their original arguments and are passed through.
pub fn scanner_args(args: &[String]) -> Vec<String> {
    if is_resume(args) {
        return args.to_vec();
    }

    let mut out = Vec::with_capacity(args.len() + 4);
    let mut xml_seen = false;
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            XML_OUTPUT => {
                iter.next();
                if !xml_seen {
                    out.extend([XML_OUTPUT.to_string(), STDOUT.to_string()]);
                    xml_seen = true;
                }
            }
            ALL_OUTPUT => match iter.next() {
                Some(prefix) => out.extend([
                    "-oN".to_string(),
                    format!("{prefix}.nmap"),
                    "-oG".to_string(),
                    format!("{prefix}.gnmap"),
                ]),
                None => out.push(arg.clone()),
            },
            _ => out.push(arg.clone()),
        }
    }

    if !xml_seen {
        out.extend([XML_OUTPUT.to_string(), STDOUT.to_string()]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_find_argument() {
        let a = args("-sV -oX out.xml 10.0.0.0/24");
        assert_eq!(find_argument(&a, "-oX"), Some("out.xml"));
        assert_eq!(find_argument(&a, "-oA"), None);
        assert_eq!(find_argument(&args("10.0.0.1 -oX"), "-oX"), None);
    }

    #[test]
    fn test_output_target_xml() {
        assert_eq!(
            resolve_output_target(&args("-sS -oX scans/lan.xml 10.0.0.0/24")),
            Some(OutputTarget::Fresh(PathBuf::from("scans/lan.xml")))
        );
        assert_eq!(resolve_output_target(&args("-oX - 10.0.0.1")), None);
        assert_eq!(resolve_output_target(&args("-sV 10.0.0.1")), None);
    }

    #[test]
    fn test_output_target_all_formats() {
        assert_eq!(
            resolve_output_target(&args("-oA scans/lan 10.0.0.0/24")),
            Some(OutputTarget::Fresh(PathBuf::from("scans/lan.xml")))
        );
    }

    #[test]
    fn test_output_target_resume() {
        let target = resolve_output_target(&args("--resume scans/lan.gnmap")).unwrap();
        assert_eq!(target, OutputTarget::Resume(PathBuf::from("scans/lan.xml")));
        assert_eq!(target.path(), Path::new("scans/lan.xml"));
    }

    #[test]
    fn test_scanner_args_adds_stdout_report() {
        assert_eq!(scanner_args(&args("-sV 10.0.0.1")), args("-sV 10.0.0.1 -oX -"));
    }

    #[test]
    fn test_scanner_args_substitutes_xml_path() {
        assert_eq!(
            scanner_args(&args("-sV -oX out.xml 10.0.0.1")),
            args("-sV -oX - 10.0.0.1")
        );
    }

    #[test]
    fn test_scanner_args_splits_all_formats() {
        assert_eq!(
            scanner_args(&args("-sV -oA scans/lan 10.0.0.0/24")),
            args("-sV -oN scans/lan.nmap -oG scans/lan.gnmap 10.0.0.0/24 -oX -")
        );
    }

    #[test]
    fn test_scanner_args_resume_untouched() {
        let a = args("--resume scans/lan.gnmap");
        assert_eq!(scanner_args(&a), a);
    }
}
