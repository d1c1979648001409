use super::source_map::SourceMap;
use super::{Diagnostic, Severity};

/// One diagnostic as a single-line JSON object (NDJSON-friendly).
pub fn render(d: &Diagnostic) -> String {
    let severity = match d.severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
    };

    let mut obj = serde_json::json!({
        "severity": severity,
        "message": d.message,
        "notes": d.notes,
    });

    if let Some(code) = d.code {
        obj["code"] = serde_json::Value::String(code.to_string());
    }

    if let Some((span, label)) = &d.label {
        let mut l = serde_json::json!({
            "start": span.start,
            "end": span.end,
            "message": label,
        });
        if let Some(source) = &d.source {
            let (line, col) = SourceMap::new(source).lookup(span.start);
            l["line"] = serde_json::Value::from(line);
            l["col"] = serde_json::Value::from(col);
        }
        obj["label"] = l;
    }

    serde_json::to_string(&obj).unwrap_or_else(|_| {
        r#"{"severity":"error","message":"internal error serializing diagnostic"}"#.to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_json(s: &str) -> serde_json::Value {
        serde_json::from_str(s).expect("valid JSON")
    }

    #[test]
    fn render_basic_error() {
        let out = render(&Diagnostic::error("Not callable").with_code("VMP-R002"));
        let v = parse_json(&out);
        assert_eq!(v["severity"], "error");
        assert_eq!(v["message"], "Not callable");
        assert_eq!(v["code"], "VMP-R002");
    }

    #[test]
    fn render_with_span_and_source() {
        let d = Diagnostic::error("Expect ;, got eof")
            .with_span(9..10, "here")
            .with_source("let a = 1".to_string());
        let v = parse_json(&render(&d));
        assert_eq!(v["label"]["start"], 9);
        assert_eq!(v["label"]["line"], 1);
        assert_eq!(v["label"]["col"], 10);
    }

    #[test]
    fn render_label_without_source_has_no_line() {
        let d = Diagnostic::error("bad").with_span(5..8, "here");
        let v = parse_json(&render(&d));
        assert!(v["label"].get("line").is_none());
    }

    #[test]
    fn render_is_single_line() {
        let d = Diagnostic::error("bad")
            .with_span(0..1, "here")
            .with_note("a note")
            .with_source("x".to_string());
        assert!(!render(&d).contains('\n'));
    }
}
