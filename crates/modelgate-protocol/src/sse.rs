use bytes::Bytes;

/// One server-sent event: optional `event:` name plus joined `data:` lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerEvent {
    pub name: Option<String>,
    pub data: String,
}

impl ServerEvent {
    pub fn data_only(data: impl Into<String>) -> Self {
        Self {
            name: None,
            data: data.into(),
        }
    }
}

/// Incremental SSE decoder.
///
/// Feed it arbitrary byte chunks; complete events come back as they close.
/// Field lines other than `event:` and `data:` (ids, retry hints, comments)
/// are skipped.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    pending: String,
    name: Option<String>,
    data: Vec<String>,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &Bytes) -> Vec<ServerEvent> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };
        self.feed_str(text)
    }

    pub fn feed_str(&mut self, chunk: &str) -> Vec<ServerEvent> {
        self.pending.push_str(chunk);
        let mut out = Vec::new();
        while let Some(end) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=end).collect();
            self.take_line(line.trim_end_matches(['\n', '\r']), &mut out);
        }
        out
    }

    /// Flush whatever is buffered at end of stream. Some upstreams close the
    /// connection without a trailing blank line after the last event.
    pub fn finish(&mut self) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.take_line(line.trim_end_matches('\r'), &mut out);
        }
        self.close_event(&mut out);
        out
    }

    fn take_line(&mut self, line: &str, out: &mut Vec<ServerEvent>) {
        if line.is_empty() {
            self.close_event(out);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.name = (!value.is_empty()).then(|| value.to_string());
            }
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
    }

    fn close_event(&mut self, out: &mut Vec<ServerEvent>) {
        if self.name.is_none() && self.data.is_empty() {
            return;
        }
        out.push(ServerEvent {
            name: self.name.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        });
    }
}
