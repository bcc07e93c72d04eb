//! Indented writer for the brace-delimited configuration grammar

use super::escape::escape_config;

/// Builds configuration text block by block
#[derive(Debug, Default)]
pub struct ConfigWriter {
    /// Output buffer
    buf: String,
    /// Current nesting depth
    depth: usize,
}

impl ConfigWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn indent(&mut self) {
        for _ in 0..self.depth {
            self.buf.push('\t');
        }
    }

    /// Opens `<header> {`. Header words are written as given.
    pub fn begin_block(&mut self, header: &str) {
        self.indent();
        self.buf.push_str(header);
        self.buf.push_str(" {\n");
        self.depth += 1;
    }

    /// Closes the innermost block
    pub fn end_block(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        self.indent();
        self.buf.push_str("}\n");
    }

    /// `name value;` with the value escaped
    pub fn statement(&mut self, name: &str, value: &str) {
        self.indent();
        self.buf.push_str(name);
        self.buf.push(' ');
        self.buf.push_str(&escape_config(value));
        self.buf.push_str(";\n");
    }

    /// `name;`
    pub fn flag(&mut self, name: &str) {
        self.indent();
        self.buf.push_str(name);
        self.buf.push_str(";\n");
    }

    /// A statement whose words are already formatted, e.g. an address
    pub fn raw(&mut self, line: &str) {
        self.indent();
        self.buf.push_str(line);
        self.buf.push_str(";\n");
    }

    /// Write a block only when `lines` is not empty
    pub fn block_of(&mut self, header: &str, lines: &[Line]) {
        if lines.is_empty() {
            return;
        }
        self.begin_block(header);
        for line in lines {
            self.line(line);
        }
        self.end_block();
    }

    pub fn line(&mut self, line: &Line) {
        match line {
            Line::Statement(name, value) => self.statement(name, value),
            Line::Flag(name) => self.flag(name),
            Line::Raw(text) => self.raw(text),
            Line::Block(header, inner) => self.block_of(header, inner),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn finish(self) -> String {
        self.buf
    }
}

/// A buffered line, used when a block may turn out empty
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Statement(String, String),
    Flag(String),
    Raw(String),
    Block(String, Vec<Line>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_blocks() {
        let mut w = ConfigWriter::new();
        w.begin_block("resource r0");
        w.statement("protocol", "C");
        w.begin_block("on alpha");
        w.raw("address 10.0.0.1:7788");
        w.end_block();
        w.end_block();
        assert_eq!(w.depth(), 0);
        assert_eq!(
            w.finish(),
            "resource r0 {\n\tprotocol C;\n\ton alpha {\n\t\taddress 10.0.0.1:7788;\n\t}\n}\n"
        );
    }

    #[test]
    fn test_empty_block_is_skipped() {
        let mut w = ConfigWriter::new();
        w.block_of("net", &[]);
        w.block_of(
            "proxy",
            &[Line::Block("plugin".into(), vec![Line::Flag("debug".into())])],
        );
        assert_eq!(w.finish(), "proxy {\n\tplugin {\n\t\tdebug;\n\t}\n}\n");
    }
}
