use std::future::Future;
use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;
use tokio::io::AsyncBufRead;
use shared::protocol::{HOST_ELEMENT, RUN_ELEMENT, TESTED_VERSIONS};
use shared::types::{Address, AddressKind, OsClass, OsMatch, ScanRecord, ServiceRecord};

/// Receives each decoded host, in document order, before decoding continues.
///
/// Returning an error stops decoding.
pub trait HostHandler: Send {
    fn on_host(&mut self, record: ScanRecord) -> impl Future<Output = anyhow::Result<()>> + Send;
}

impl<F, Fut> HostHandler for F
where
    F: FnMut(ScanRecord) -> Fut + Send,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn on_host(&mut self, record: ScanRecord) -> impl Future<Output = anyhow::Result<()>> + Send {
        self(record)
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("reading <{element}>")]
    Malformed {
        element: String,
        #[source]
        source: quick_xml::Error,
    },

    #[error("reading <{element}>: invalid attribute: {message}")]
    Attribute { element: String, message: String },

    #[error("reading <{element}>: missing {attribute} attribute")]
    MissingAttribute { element: String, attribute: &'static str },

    #[error("reading <{element}>: invalid {attribute} value {value:?}")]
    InvalidValue {
        element: String,
        attribute: &'static str,
        value: String,
    },

    #[error("handling <host> {host}")]
    Handler {
        host: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Outcome of one decode pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeSummary {
    pub scanner_version: Option<String>,
    pub version_tested: bool,
    /// Hosts accepted by the handler.
    pub hosts: usize,
    /// The closing run element was seen; `false` means the input was cut short.
    pub finished: bool,
}

/// Decode a report from `reader`, handing every host to `handler`.
///
/// The report is a single `<nmaprun>` element holding any number of `<host>`
/// elements. Hosts are decoded one at a time as their closing tag arrives, so
/// memory stays bounded by the largest host element. Input that ends early,
/// as when the scanner is killed, is a normal outcome.
#[tracing::instrument(name = "decode", skip_all)]
pub async fn decode<R, H>(reader: R, handler: &mut H) -> Result<DecodeSummary, DecodeError>
where
    R: AsyncBufRead + Unpin,
    H: HostHandler,
{
    let mut reader = Reader::from_reader(reader);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut summary = DecodeSummary::default();

    loop {
        buf.clear();
        let token = match reader.read_event_into_async(&mut buf).await {
            Ok(Event::Start(e)) if is(&e, RUN_ELEMENT) => Token::RunStart(attr(&e, RUN_ELEMENT, b"version")?),
            Ok(Event::Empty(e)) if is(&e, RUN_ELEMENT) => Token::EmptyRun(attr(&e, RUN_ELEMENT, b"version")?),
            Ok(Event::Start(e)) if is(&e, HOST_ELEMENT) => Token::HostStart,
            Ok(Event::Empty(e)) if is(&e, HOST_ELEMENT) => Token::EmptyHost,
            Ok(Event::End(e)) if e.local_name().as_ref() == RUN_ELEMENT.as_bytes() => Token::RunEnd,
            Ok(Event::Eof) => Token::Eof,
            Ok(_) => Token::Other,
            Err(e) if is_truncation(&e) => Token::Eof,
            Err(e) => {
                return Err(DecodeError::Malformed {
                    element: RUN_ELEMENT.to_string(),
                    source: e,
                })
            }
        };

        match token {
            Token::RunStart(version) => {
                summary.version_tested = check_version(version.as_deref());
                summary.scanner_version = version;
            }
            Token::EmptyRun(version) => {
                summary.version_tested = check_version(version.as_deref());
                summary.scanner_version = version;
                summary.finished = true;
                return Ok(summary);
            }
            Token::HostStart => {
                let Some(record) = decode_host(&mut reader, &mut buf).await? else {
                    tracing::debug!("Input ended inside <host>, discarding partial host");
                    return Ok(summary);
                };
                deliver(handler, record, &mut summary).await?;
            }
            Token::EmptyHost => deliver(handler, ScanRecord::default(), &mut summary).await?,
            Token::RunEnd => {
                tracing::debug!(hosts = summary.hosts, "XML document complete");
                summary.finished = true;
                return Ok(summary);
            }
            Token::Eof => {
                tracing::debug!(hosts = summary.hosts, "Unexpected end of input");
                return Ok(summary);
            }
            Token::Other => {}
        }
    }
}

/// Warn when the report comes from a scanner version outside the tested set.
pub fn check_version(version: Option<&str>) -> bool {
    let tested = version.is_some_and(|v| TESTED_VERSIONS.contains(&v));
    if !tested {
        tracing::warn!(
            "db-nmap was not tested against scanner version {}!",
            version.unwrap_or("<unknown>")
        );
    }
    tested
}

/// Top-level token, detached from the read buffer.
enum Token {
    RunStart(Option<String>),
    EmptyRun(Option<String>),
    HostStart,
    EmptyHost,
    RunEnd,
    Eof,
    Other,
}

async fn deliver<H: HostHandler>(
    handler: &mut H,
    record: ScanRecord,
    summary: &mut DecodeSummary,
) -> Result<(), DecodeError> {
    let host = record.to_string();
    tracing::debug!(host = %host, services = record.services.len(), "Decoded host");

    handler
        .on_host(record)
        .await
        .map_err(|source| DecodeError::Handler { host, source })?;
    summary.hosts += 1;
    Ok(())
}

/// Decode the body of a `<host>` whose start tag was just read.
///
/// Returns `None` when the input ends before the closing tag.
async fn decode_host<R>(reader: &mut Reader<R>, buf: &mut Vec<u8>) -> Result<Option<ScanRecord>, DecodeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut builder = HostBuilder::default();
    let mut open: Vec<String> = Vec::new();

    loop {
        buf.clear();
        let event = match reader.read_event_into_async(buf).await {
            Ok(event) => event,
            Err(e) if is_truncation(&e) => return Ok(None),
            Err(e) => {
                return Err(DecodeError::Malformed {
                    element: element_path(&open),
                    source: e,
                })
            }
        };

        match event {
            Event::Start(e) => {
                let name = local_name(&e);
                builder.open(&name, open.last().map(String::as_str), &e)?;
                open.push(name);
            }
            Event::Empty(e) => {
                let name = local_name(&e);
                builder.open(&name, open.last().map(String::as_str), &e)?;
                builder.close(&name);
            }
            Event::End(_) => match open.pop() {
                Some(name) => builder.close(&name),
                None => return Ok(Some(builder.finish())),
            },
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

#[derive(Default)]
struct HostBuilder {
    record: ScanRecord,
    port: Option<ServiceRecord>,
}

impl HostBuilder {
    fn open(&mut self, name: &str, parent: Option<&str>, e: &BytesStart<'_>) -> Result<(), DecodeError> {
        match name {
            "status" => self.record.status = attr(e, name, b"state")?,
            "address" => {
                let addr = attr(e, name, b"addr")?;
                let kind = attr(e, name, b"addrtype")?;
                match (addr, kind.as_deref().and_then(AddressKind::parse)) {
                    (Some(addr), Some(kind)) => self.record.addresses.push(Address { addr, kind }),
                    (addr, _) => tracing::debug!(?addr, ?kind, "Ignoring address entry"),
                }
            }
            "hostname" if parent == Some("hostnames") => {
                if let Some(hostname) = attr(e, name, b"name")? {
                    self.record.hostnames.push(hostname);
                }
            }
            "port" => {
                let portid = attr(e, name, b"portid")?.ok_or_else(|| DecodeError::MissingAttribute {
                    element: name.to_string(),
                    attribute: "portid",
                })?;
                let port = portid.parse().map_err(|_| DecodeError::InvalidValue {
                    element: name.to_string(),
                    attribute: "portid",
                    value: portid.clone(),
                })?;

                self.flush_port();
                self.port = Some(ServiceRecord {
                    port,
                    protocol: attr(e, name, b"protocol")?.unwrap_or_default(),
                    ..Default::default()
                });
            }
            "state" => {
                if let Some(port) = self.port.as_mut() {
                    port.state = attr(e, name, b"state")?;
                }
            }
            "service" => {
                if let Some(port) = self.port.as_mut() {
                    port.name = attr(e, name, b"name")?;
                    port.product = attr(e, name, b"product")?;
                    port.version = attr(e, name, b"version")?;
                    port.tunnel = attr(e, name, b"tunnel")?;
                }
            }
            "osmatch" => {
                if let Some(os) = attr(e, name, b"name")? {
                    self.record.os_matches.push(OsMatch {
                        name: os,
                        accuracy: parse_accuracy(attr(e, name, b"accuracy")?),
                    });
                }
            }
            "osclass" => self.record.os_classes.push(OsClass {
                class_type: attr(e, name, b"type")?,
                vendor: attr(e, name, b"vendor")?,
                accuracy: parse_accuracy(attr(e, name, b"accuracy")?),
            }),
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self, name: &str) {
        if name == "port" {
            self.flush_port();
        }
    }

    fn flush_port(&mut self) {
        if let Some(port) = self.port.take() {
            self.record.services.push(port);
        }
    }

    fn finish(mut self) -> ScanRecord {
        self.flush_port();
        self.record
    }
}

fn is(e: &BytesStart<'_>, name: &str) -> bool {
    e.local_name().as_ref() == name.as_bytes()
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn element_path(open: &[String]) -> String {
    std::iter::once(HOST_ELEMENT)
        .chain(open.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join("/")
}

fn attr(e: &BytesStart<'_>, element: &str, key: &[u8]) -> Result<Option<String>, DecodeError> {
    let invalid = |message: String| DecodeError::Attribute {
        element: element.to_string(),
        message,
    };

    let Some(attribute) = e.try_get_attribute(key).map_err(|err| invalid(err.to_string()))? else {
        return Ok(None);
    };

    let value = attribute.unescape_value().map_err(|err| invalid(err.to_string()))?;
    Ok(Some(value.into_owned()))
}

fn parse_accuracy(value: Option<String>) -> Option<u8> {
    value.and_then(|v| v.parse().ok())
}

/// Tokenizer errors that can only come from running out of input.
fn is_truncation(err: &quick_xml::Error) -> bool {
    match err {
        quick_xml::Error::Syntax(syntax) => !matches!(syntax, SyntaxError::InvalidBangMarkup),
        quick_xml::Error::Io(io) => io.kind() == std::io::ErrorKind::UnexpectedEof,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    const FIXTURE: &str = include_str!("../../testdata/scanme.xml");

    /// Collects hosts; optionally fails on the n-th one (1-based).
    #[derive(Default)]
    struct Collect {
        hosts: Vec<ScanRecord>,
        fail_on: Option<usize>,
    }

    impl HostHandler for Collect {
        async fn on_host(&mut self, record: ScanRecord) -> anyhow::Result<()> {
            if self.fail_on == Some(self.hosts.len() + 1) {
                anyhow::bail!("stop requested");
            }
            self.hosts.push(record);
            Ok(())
        }
    }

    fn host_xml(addr: &str, port: u16) -> String {
        format!(
            r#"<host><status state="up"/><address addr="{addr}" addrtype="ipv4"/><hostnames><hostname name="h-{port}"/></hostnames><ports><port protocol="tcp" portid="{port}"><state state="open"/><service name="svc"/></port></ports></host>"#
        )
    }

    fn document(version: &str, hosts: &[String], close: bool) -> String {
        let mut doc = format!(r#"<?xml version="1.0"?><nmaprun scanner="nmap" version="{version}">"#);
        for host in hosts {
            doc.push_str(host);
        }
        if close {
            doc.push_str("</nmaprun>");
        }
        doc
    }

    #[tokio::test]
    async fn test_decode_fixture() {
        let mut collect = Collect::default();
        let summary = decode(FIXTURE.as_bytes(), &mut collect).await.unwrap();

        assert_eq!(
            summary,
            DecodeSummary {
                scanner_version: Some("7.94".to_string()),
                version_tested: true,
                hosts: 2,
                finished: true,
            }
        );

        let scanme = &collect.hosts[0];
        assert_eq!(scanme.status.as_deref(), Some("up"));
        assert_eq!(scanme.preferred_address().unwrap().to_string(), "45.33.32.156");
        assert_eq!(scanme.hostnames, vec!["scanme.nmap.org", "Scanme.Nmap.org"]);
        assert_eq!(scanme.services.len(), 5);
        assert_eq!(scanme.open_services().count(), 4);

        let ssh = &scanme.services[0];
        assert_eq!((ssh.port, ssh.protocol.as_str()), (22, "tcp"));
        assert_eq!(ssh.info().as_deref(), Some("OpenSSH 6.6.1p1 Ubuntu 2ubuntu2.13"));

        let https = &scanme.services[3];
        assert_eq!(https.name_with_tunnel().as_deref(), Some("ssl/http"));
        assert_eq!(https.info().as_deref(), Some("nginx"));

        assert_eq!(scanme.os_name(), Some("Linux 4.15 - 5.8"));
        assert_eq!(scanme.os_matches[1].accuracy, Some(94));
        assert_eq!(scanme.os_classes.len(), 3);
        assert_eq!(scanme.purpose(), Some("general purpose"));

        let vbox = &collect.hosts[1];
        assert_eq!(vbox.first_mac().as_deref(), Some("08:00:27:4e:1a:9c"));
        assert!(vbox.hostnames.is_empty());
        assert!(!vbox.has_open_services());
    }

    #[tokio::test]
    async fn test_truncated_mid_attribute() {
        let mut doc = document("7.94", &[host_xml("10.0.0.1", 22), host_xml("10.0.0.2", 80)], false);
        doc.push_str(r#"<host starttime="17102"#);

        let mut collect = Collect::default();
        let summary = decode(doc.as_bytes(), &mut collect).await.unwrap();

        assert_eq!(collect.hosts.len(), 2);
        assert_eq!(summary.hosts, 2);
        assert!(!summary.finished);
    }

    #[tokio::test]
    async fn test_truncated_inside_host() {
        let mut doc = document("7.94", &[host_xml("10.0.0.1", 22)], false);
        doc.push_str(r#"<host><address addr="10.0.0.2" addrtype="ipv4"/><ports><port protocol="tcp" portid="443">"#);

        let mut collect = Collect::default();
        let summary = decode(doc.as_bytes(), &mut collect).await.unwrap();

        assert_eq!(collect.hosts.len(), 1);
        assert!(!summary.finished);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let mut collect = Collect::default();
        let summary = decode(&b""[..], &mut collect).await.unwrap();

        assert_eq!(summary, DecodeSummary::default());
    }

    #[tokio::test]
    async fn test_untested_version_still_decodes() {
        let doc = document("1.23", &[host_xml("10.0.0.1", 22), host_xml("10.0.0.2", 80)], true);

        let mut collect = Collect::default();
        let summary = decode(doc.as_bytes(), &mut collect).await.unwrap();

        assert_eq!(collect.hosts.len(), 2);
        assert!(!summary.version_tested);
        assert_eq!(summary.scanner_version.as_deref(), Some("1.23"));
        assert!(summary.finished);
    }

    /// In-memory log sink for a scoped test subscriber.
    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLog {
        fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLog {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn check_version_logged(version: Option<&str>) -> (bool, String) {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let tested = tracing::subscriber::with_default(subscriber, || check_version(version));
        (tested, log.contents())
    }

    #[test]
    fn test_check_version() {
        let (tested, log) = check_version_logged(Some("7.92"));
        assert!(tested);
        assert!(log.is_empty(), "unexpected log output: {log}");

        let (tested, log) = check_version_logged(Some("1.23"));
        assert!(!tested);
        assert!(log.contains("WARN"));
        assert!(log.contains("not tested against scanner version 1.23"));

        let (tested, log) = check_version_logged(None);
        assert!(!tested);
        assert!(log.contains("not tested against scanner version <unknown>"));
    }

    #[tokio::test]
    async fn test_malformed_error_keeps_cause_in_source() {
        let bad = r#"<host><ports></hostnames></host>"#.to_string();
        let doc = document("7.94", &[bad], true);

        let err = decode(doc.as_bytes(), &mut Collect::default()).await.unwrap_err();

        assert_eq!(err.to_string(), "reading <host/ports>");
        let cause = std::error::Error::source(&err).unwrap().to_string();
        assert!(cause.contains("hostnames"), "{cause}");
    }

    #[tokio::test]
    async fn test_handler_failure_stops_decoding() {
        let hosts: Vec<String> = (1..=3).map(|i| host_xml(&format!("10.0.0.{i}"), 22)).collect();
        let doc = document("7.94", &hosts, true);

        let mut collect = Collect { fail_on: Some(2), ..Default::default() };
        let err = decode(doc.as_bytes(), &mut collect).await.unwrap_err();

        match err {
            DecodeError::Handler { host, .. } => assert_eq!(host, "10.0.0.2"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(collect.hosts.len(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_tag_is_fatal() {
        let bad = r#"<host><address addr="10.0.0.3" addrtype="ipv4"/><ports></hostnames></host>"#.to_string();
        let doc = document("7.94", &[host_xml("10.0.0.1", 22), bad, host_xml("10.0.0.4", 22)], true);

        let mut collect = Collect::default();
        let err = decode(doc.as_bytes(), &mut collect).await.unwrap_err();

        match &err {
            DecodeError::Malformed { element, .. } => assert_eq!(element, "host/ports"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(collect.hosts.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_port_number_is_fatal() {
        let bad = r#"<host><ports><port protocol="tcp" portid="http"/></ports></host>"#.to_string();
        let doc = document("7.94", &[bad], true);

        let err = decode(doc.as_bytes(), &mut Collect::default()).await.unwrap_err();
        assert!(matches!(err, DecodeError::InvalidValue { attribute: "portid", .. }));
    }

    #[tokio::test]
    async fn test_stops_at_run_end() {
        let mut doc = document("7.94", &[host_xml("10.0.0.1", 22)], true);
        doc.push_str("<<<< trailing garbage");

        let mut collect = Collect::default();
        let summary = decode(doc.as_bytes(), &mut collect).await.unwrap();

        assert!(summary.finished);
        assert_eq!(collect.hosts.len(), 1);
    }

    #[tokio::test]
    async fn test_hosts_delivered_in_order_to_closure() {
        let hosts: Vec<String> = (1..=4).map(|i| host_xml(&format!("10.0.1.{i}"), 8000 + i)).collect();
        let doc = document("7.92", &hosts, true);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handler = move |record: ScanRecord| {
            let sent = tx.send(record.to_string());
            async move {
                sent?;
                Ok::<_, anyhow::Error>(())
            }
        };

        let summary = decode(doc.as_bytes(), &mut handler).await.unwrap();
        assert_eq!(summary.hosts, 4);

        let mut seen = Vec::new();
        while let Ok(host) = rx.try_recv() {
            seen.push(host);
        }
        assert_eq!(seen, vec!["10.0.1.1", "10.0.1.2", "10.0.1.3", "10.0.1.4"]);
    }

    #[tokio::test]
    async fn test_empty_host_element() {
        let doc = document("7.94", &["<host/>".to_string()], true);

        let mut collect = Collect::default();
        decode(doc.as_bytes(), &mut collect).await.unwrap();

        assert_eq!(collect.hosts, vec![ScanRecord::default()]);
    }
}
