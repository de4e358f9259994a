//! Document-level checks quick-xml leaves to the caller: one root element,
//! every element closed before end of input, only whitespace outside the root.

#[derive(Debug, Default)]
pub(crate) struct ElementPath {
    open: Vec<String>,
    seen_root: bool,
}

impl ElementPath {
    pub(crate) fn open(&mut self, name: String) -> Result<(), String> {
        self.enter(&name)?;
        self.open.push(name);
        Ok(())
    }

    /// A self-closing element.
    pub(crate) fn empty(&mut self, name: &str) -> Result<(), String> {
        self.enter(name)
    }

    pub(crate) fn close(&mut self) -> Option<String> {
        self.open.pop()
    }

    pub(crate) fn text(&self, text: &[u8]) -> Result<(), String> {
        if !self.open.is_empty() || text.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        if self.seen_root {
            Err("unexpected text after the root element".to_string())
        } else {
            Err("unexpected text before the root element".to_string())
        }
    }

    pub(crate) fn path(&self) -> &[String] {
        &self.open
    }

    pub(crate) fn finish(&self) -> Result<(), String> {
        if let Some(name) = self.open.last() {
            return Err(format!("unexpected end of document: unclosed <{name}>"));
        }
        if !self.seen_root {
            return Err("document has no root element".to_string());
        }
        Ok(())
    }

    fn enter(&mut self, name: &str) -> Result<(), String> {
        if self.open.is_empty() {
            if self.seen_root {
                return Err(format!("unexpected second root element <{name}>"));
            }
            self.seen_root = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_document_finishes() {
        let mut path = ElementPath::default();
        path.open("a".to_string()).expect("root");
        path.empty("b").expect("child");
        assert_eq!(path.path(), ["a".to_string()]);
        assert_eq!(path.close().as_deref(), Some("a"));
        path.text(b"\n  ").expect("trailing whitespace");
        assert!(path.finish().is_ok());
    }

    #[test]
    fn unclosed_element_is_reported_by_name() {
        let mut path = ElementPath::default();
        path.open("a".to_string()).expect("root");
        path.open("b".to_string()).expect("child");
        assert_eq!(
            path.finish().unwrap_err(),
            "unexpected end of document: unclosed <b>"
        );
    }

    #[test]
    fn content_outside_the_root_is_rejected() {
        let mut path = ElementPath::default();
        assert!(path.text(b"junk").is_err());
        path.empty("a").expect("root");
        assert!(path.text(b"tail").is_err());
        assert!(path.empty("b").is_err());
        assert!(ElementPath::default().finish().is_err());
    }
}
