/// Scanner versions whose XML output has been verified against the decoder
pub const TESTED_VERSIONS: &[&str] = &["7.91", "7.92", "7.93", "7.94", "7.95"];

/// Element names of the report document
pub const RUN_ELEMENT: &str = "nmaprun";
pub const HOST_ELEMENT: &str = "host";

/// Port state that is persisted; every other state is dropped
pub const STATE_OPEN: &str = "open";

/// Host state written whenever a host with open ports is reconciled
pub const HOST_ALIVE: &str = "alive";

/// First-insert defaults for hosts without OS detection results
pub const DEFAULT_OS_NAME: &str = "Unknown";
pub const DEFAULT_PURPOSE: &str = "device";

/// Extension of the persisted report copy
pub const REPORT_EXTENSION: &str = "xml";
