/// Byte-offset → line/column mapping for rendering error locations.
pub struct SourceMap {
    line_starts: Vec<usize>,
}

impl SourceMap {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        SourceMap { line_starts }
    }

    /// 1-based (line, column) for a byte offset. Offsets past the end map to
    /// the last line.
    pub fn lookup(&self, offset: usize) -> (usize, usize) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        (line + 1, offset - self.line_starts[line] + 1)
    }

    /// The text of a 1-based line, without its terminator.
    pub fn line_text<'a>(&self, source: &'a str, line: usize) -> &'a str {
        let start = self.line_starts[line - 1];
        let end = self
            .line_starts
            .get(line)
            .map(|&next| next - 1)
            .unwrap_or(source.len());
        &source[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_lookup() {
        let map = SourceMap::new("let a = 1;");
        assert_eq!(map.lookup(0), (1, 1));
        assert_eq!(map.lookup(4), (1, 5));
    }

    #[test]
    fn second_line_lookup() {
        let source = "let a = 1;\nprint(a);";
        let map = SourceMap::new(source);
        assert_eq!(map.lookup(11), (2, 1));
        assert_eq!(map.line_text(source, 2), "print(a);");
    }

    #[test]
    fn line_start_boundary() {
        let source = "a\nb\nc";
        let map = SourceMap::new(source);
        assert_eq!(map.lookup(2), (2, 1));
        assert_eq!(map.line_text(source, 1), "a");
        assert_eq!(map.line_text(source, 3), "c");
    }

    #[test]
    fn offset_past_end_maps_to_last_line() {
        let map = SourceMap::new("ab");
        assert_eq!(map.lookup(2), (1, 3));
    }
}
