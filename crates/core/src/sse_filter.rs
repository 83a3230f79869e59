use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long a usage-less stop chunk keeps its trace eligible for a late
/// usage chunk.
const STOP_TRACE_TTL: Duration = Duration::from_secs(10 * 60);

/// Retains `usageMetadata` only on terminal chunks. Intermediate chunks get
/// it renamed to `cpaUsageMetadata` so clients that sum usage per chunk do
/// not double-count.
///
/// Some upstreams emit the terminal chunk with no usage at all and deliver
/// the real usage on a trailing chunk. The filter remembers such stop
/// chunks per `traceId` and lets exactly one later usage-bearing chunk with
/// the same trace through unchanged.
#[derive(Default)]
pub struct SseUsageFilter {
    stops_without_usage: Mutex<HashMap<String, Instant>>,
}

impl SseUsageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter a raw SSE payload (possibly several `data:` lines). Lines
    /// that are not data-framed JSON pass through byte-identical.
    pub fn filter(&self, raw: &str) -> String {
        if !raw.contains("usageMetadata") && !raw.contains("finishReason") {
            return raw.to_string();
        }
        let mut out: Vec<String> = Vec::with_capacity(1);
        for line in raw.split('\n') {
            out.push(self.filter_line(line));
        }
        out.join("\n")
    }

    fn filter_line(&self, line: &str) -> String {
        let Some(json_part) = line.strip_prefix("data:").map(str::trim_start) else {
            return line.to_string();
        };
        match self.filter_payload(json_part) {
            Some(filtered) => format!("data: {filtered}"),
            None => line.to_string(),
        }
    }

    /// Filter a bare JSON data payload (no `data:` framing). Returns the
    /// rewritten payload, or `None` when the input passes unchanged.
    pub fn filter_payload(&self, json_part: &str) -> Option<String> {
        let Ok(mut chunk) = serde_json::from_str::<Value>(json_part) else {
            return None;
        };

        let has_usage = has_usage(&chunk);
        let trace_id = trace_id_of(&chunk);

        if is_terminal(&chunk) {
            if !has_usage
                && let Some(trace) = trace_id
            {
                self.purge_expired();
                self.stops_without_usage
                    .lock()
                    .unwrap()
                    .insert(trace, Instant::now());
            }
            return None;
        }

        if !has_usage {
            return None;
        }

        // A usage chunk arriving after a usage-less stop for the same trace
        // is forwarded unchanged, once.
        if let Some(trace) = trace_id {
            let mut stops = self.stops_without_usage.lock().unwrap();
            if let Some(seen) = stops.get(&trace) {
                let fresh = seen.elapsed() < STOP_TRACE_TTL;
                stops.remove(&trace);
                if fresh {
                    return None;
                }
            }
        }

        rename_usage(&mut chunk);
        Some(chunk.to_string())
    }

    fn purge_expired(&self) {
        let mut stops = self.stops_without_usage.lock().unwrap();
        stops.retain(|_, seen| seen.elapsed() < STOP_TRACE_TTL);
    }
}

/// The object usage and candidates live under: the chunk root, or the
/// nested `response` used by enveloped Gemini-CLI payloads.
fn usage_roots(chunk: &Value) -> [Option<&Value>; 2] {
    [Some(chunk), chunk.get("response")]
}

fn is_terminal(chunk: &Value) -> bool {
    usage_roots(chunk).into_iter().flatten().any(|root| {
        root.get("candidates")
            .and_then(|c| c.as_array())
            .is_some_and(|arr| arr.iter().any(|cand| cand.get("finishReason").is_some()))
    })
}

fn has_usage(chunk: &Value) -> bool {
    usage_roots(chunk)
        .into_iter()
        .flatten()
        .any(|root| root.get("usageMetadata").is_some())
}

fn trace_id_of(chunk: &Value) -> Option<String> {
    usage_roots(chunk)
        .into_iter()
        .flatten()
        .find_map(|root| root.get("traceId").and_then(|v| v.as_str()))
        .map(str::to_string)
}

fn rename_usage(chunk: &mut Value) {
    if let Some(nested) = chunk.get_mut("response")
        && let Some(obj) = nested.as_object_mut()
        && let Some(usage) = obj.remove("usageMetadata")
    {
        obj.insert("cpaUsageMetadata".into(), usage);
    }
    if let Some(obj) = chunk.as_object_mut()
        && let Some(usage) = obj.remove("usageMetadata")
    {
        obj.insert("cpaUsageMetadata".into(), usage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_intermediate_usage_renamed() {
        let filter = SseUsageFilter::new();
        let chunk = json!({
            "candidates": [{"content": {"parts": [{"text": "hi"}]}}],
            "usageMetadata": {"promptTokenCount": 1}
        });
        let out = filter.filter(&format!("data: {chunk}"));
        let v: Value = serde_json::from_str(out.strip_prefix("data: ").unwrap()).unwrap();
        assert!(v.get("usageMetadata").is_none());
        assert_eq!(v["cpaUsageMetadata"]["promptTokenCount"], 1);
    }

    #[test]
    fn test_terminal_chunk_unchanged() {
        let filter = SseUsageFilter::new();
        let line = r#"data: {"candidates":[{"finishReason":"STOP","content":{"parts":[{"text":"done"}]}}],"usageMetadata":{"promptTokenCount":1,"candidatesTokenCount":1,"totalTokenCount":2}}"#;
        assert_eq!(filter.filter(line), line);
    }

    #[test]
    fn test_chunk_without_usage_unchanged() {
        let filter = SseUsageFilter::new();
        let line = r#"data: {"candidates":[{"content":{"parts":[{"text":"hi"}]}}]}"#;
        assert_eq!(filter.filter(line), line);
    }

    #[test]
    fn test_nested_response_usage_renamed() {
        let filter = SseUsageFilter::new();
        let chunk = json!({
            "response": {
                "candidates": [{"content": {"parts": [{"text": "hi"}]}}],
                "usageMetadata": {"promptTokenCount": 3}
            }
        });
        let out = filter.filter(&format!("data: {chunk}"));
        let v: Value = serde_json::from_str(out.strip_prefix("data: ").unwrap()).unwrap();
        assert!(v["response"].get("usageMetadata").is_none());
        assert_eq!(v["response"]["cpaUsageMetadata"]["promptTokenCount"], 3);
    }

    #[test]
    fn test_late_usage_after_empty_stop_passes_once() {
        let filter = SseUsageFilter::new();

        let stop = json!({
            "traceId": "t-1",
            "candidates": [{"finishReason": "STOP"}]
        });
        let stop_line = format!("data: {stop}");
        assert_eq!(filter.filter(&stop_line), stop_line);

        let late = json!({
            "traceId": "t-1",
            "usageMetadata": {"promptTokenCount": 5, "totalTokenCount": 9}
        });
        let late_line = format!("data: {late}");
        // First trailing usage chunk is forwarded unchanged...
        assert_eq!(filter.filter(&late_line), late_line);
        // ...but only once; the next one is renamed again.
        let again = filter.filter(&late_line);
        assert!(again.contains("cpaUsageMetadata"));
    }

    #[test]
    fn test_non_data_lines_untouched() {
        let filter = SseUsageFilter::new();
        assert_eq!(filter.filter("event: ping"), "event: ping");
        assert_eq!(filter.filter("data: [DONE]"), "data: [DONE]");
    }

    #[test]
    fn test_multi_line_payload() {
        let filter = SseUsageFilter::new();
        let a = json!({"candidates": [{"content": {"parts": [{"text": "a"}]}}], "usageMetadata": {"promptTokenCount": 1}});
        let b = json!({"candidates": [{"finishReason": "STOP"}], "usageMetadata": {"totalTokenCount": 2}});
        let raw = format!("data: {a}\ndata: {b}");
        let out = filter.filter(&raw);
        let lines: Vec<&str> = out.split('\n').collect();
        assert!(lines[0].contains("cpaUsageMetadata"));
        assert_eq!(lines[1], format!("data: {b}"));
    }
}
