//! Label selector parsing and evaluation.
//!
//! Supported grammar:
//!
//! ```text
//! expr   := and ( "||" and )*
//! and    := unary ( "&&" unary )*
//! unary  := "!" unary | "(" expr ")" | term
//! term   := "all()" | "global()" | "has(" key ")"
//!         | key "==" value | key "!=" value
//!         | key "in" "{" values "}" | key "not in" "{" values "}"
//! value  := single or double quoted string
//! ```
//!
//! An empty selector is `all()`. `global()` selects non-namespaced
//! resources and never matches a label set on its own.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use flowsim_contracts::error::{FlowsimError, FlowsimResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    All,
    Global,
    Has(String),
    Equals(String, String),
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Not(Box<Selector>),
    And(Box<Selector>, Box<Selector>),
    Or(Box<Selector>, Box<Selector>),
}

impl Selector {
    pub fn parse(selector: &str) -> FlowsimResult<Selector> {
        if selector.trim().is_empty() {
            return Ok(Selector::All);
        }
        let mut parser = Parser { src: selector, pos: 0 };
        let parsed = parser.parse_or()?;
        parser.skip_ws();
        if parser.pos != selector.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(parsed)
    }

    pub fn evaluate(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Selector::All => true,
            Selector::Global => false,
            Selector::Has(k) => labels.contains_key(k),
            Selector::Equals(k, v) => labels.get(k) == Some(v),
            Selector::NotEquals(k, v) => labels.get(k) != Some(v),
            Selector::In(k, vs) => labels.get(k).is_some_and(|v| vs.contains(v)),
            Selector::NotIn(k, vs) => !labels.get(k).is_some_and(|v| vs.contains(v)),
            Selector::Not(s) => !s.evaluate(labels),
            Selector::And(a, b) => a.evaluate(labels) && b.evaluate(labels),
            Selector::Or(a, b) => a.evaluate(labels) || b.evaluate(labels),
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Selector::Global)
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: &str) -> FlowsimError {
        FlowsimError::InvalidSelector {
            selector: self.src.to_string(),
            reason: format!("{reason} at offset {}", self.pos),
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    /// Consume `token` (after whitespace) if it is next.
    fn eat(&mut self, token: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> FlowsimResult<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{token}'")))
        }
    }

    /// Consume `word` only when it is not the prefix of a longer identifier.
    fn eat_keyword(&mut self, word: &str) -> bool {
        self.skip_ws();
        let rest = self.rest();
        if rest.starts_with(word) && !rest[word.len()..].starts_with(is_key_char) {
            self.pos += word.len();
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> FlowsimResult<Selector> {
        let mut lhs = self.parse_and()?;
        while self.eat("||") {
            let rhs = self.parse_and()?;
            lhs = Selector::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> FlowsimResult<Selector> {
        let mut lhs = self.parse_unary()?;
        while self.eat("&&") {
            let rhs = self.parse_unary()?;
            lhs = Selector::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> FlowsimResult<Selector> {
        self.skip_ws();
        if self.rest().starts_with("!") && !self.rest().starts_with("!=") {
            self.pos += 1;
            return Ok(Selector::Not(Box::new(self.parse_unary()?)));
        }
        if self.eat("(") {
            let inner = self.parse_or()?;
            self.expect(")")?;
            return Ok(inner);
        }
        self.parse_term()
    }

    fn parse_term(&mut self) -> FlowsimResult<Selector> {
        let key = self.parse_key()?;

        // Function forms.
        let save = self.pos;
        if self.eat("(") {
            return match key {
                "all" => self.expect(")").map(|_| Selector::All),
                "global" => self.expect(")").map(|_| Selector::Global),
                "has" => {
                    let k = self.parse_key()?.to_string();
                    self.expect(")")?;
                    Ok(Selector::Has(k))
                }
                _ => Err(self.error(&format!("unknown function '{key}'"))),
            };
        }
        self.pos = save;

        let key = key.to_string();
        if self.eat("==") {
            return Ok(Selector::Equals(key, self.parse_value()?));
        }
        if self.eat("!=") {
            return Ok(Selector::NotEquals(key, self.parse_value()?));
        }
        if self.eat_keyword("in") {
            return Ok(Selector::In(key, self.parse_set()?));
        }
        if self.eat_keyword("not") {
            if !self.eat_keyword("in") {
                return Err(self.error("expected 'in' after 'not'"));
            }
            return Ok(Selector::NotIn(key, self.parse_set()?));
        }
        Err(self.error(&format!("expected operator after '{key}'")))
    }

    fn parse_key(&mut self) -> FlowsimResult<&'a str> {
        self.skip_ws();
        let rest = self.rest();
        let len = rest.find(|c: char| !is_key_char(c)).unwrap_or(rest.len());
        if len == 0 {
            return Err(self.error("expected label key"));
        }
        self.pos += len;
        Ok(&rest[..len])
    }

    fn parse_value(&mut self) -> FlowsimResult<String> {
        self.skip_ws();
        let rest = self.rest();
        let quote = match rest.chars().next() {
            Some(q @ ('\'' | '"')) => q,
            _ => return Err(self.error("expected quoted value")),
        };
        match rest[1..].find(quote) {
            Some(end) => {
                self.pos += end + 2;
                Ok(rest[1..end + 1].to_string())
            }
            None => Err(self.error("unterminated string")),
        }
    }

    fn parse_set(&mut self) -> FlowsimResult<BTreeSet<String>> {
        self.expect("{")?;
        let mut values = BTreeSet::new();
        if self.eat("}") {
            return Ok(values);
        }
        loop {
            values.insert(self.parse_value()?);
            if self.eat("}") {
                return Ok(values);
            }
            self.expect(",")?;
        }
    }
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/')
}

/// A registered selector and the slot its result occupies in a per-flow
/// selector cache.
#[derive(Debug, Clone)]
pub struct SelectorMatcher {
    id: usize,
    selector: Arc<Selector>,
}

impl SelectorMatcher {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Evaluate against `labels`, reusing or filling the cached result.
    pub fn evaluate_cached(&self, labels: &BTreeMap<String, String>, cache: &mut [Option<bool>]) -> bool {
        match cache.get_mut(self.id) {
            Some(Some(hit)) => *hit,
            Some(slot) => {
                let result = self.selector.evaluate(labels);
                *slot = Some(result);
                result
            }
            None => self.selector.evaluate(labels),
        }
    }
}

/// Assigns each distinct endpoint selector a numeric id so identical
/// selectors across policies share one cached result per flow.
#[derive(Debug, Default)]
pub struct EndpointSelectorHandler {
    ids: HashMap<String, usize>,
    selectors: Vec<Arc<Selector>>,
}

impl EndpointSelectorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_selector_matcher(&mut self, selector: &str) -> FlowsimResult<SelectorMatcher> {
        let key = selector.trim();
        if let Some(&id) = self.ids.get(key) {
            return Ok(SelectorMatcher {
                id,
                selector: Arc::clone(&self.selectors[id]),
            });
        }
        let parsed = Arc::new(Selector::parse(key)?);
        let id = self.selectors.len();
        self.selectors.push(Arc::clone(&parsed));
        self.ids.insert(key.to_string(), id);
        Ok(SelectorMatcher { id, selector: parsed })
    }

    pub fn len(&self) -> usize {
        self.selectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty()
    }

    /// A fresh, empty result cache sized for every registered selector.
    pub fn create_selector_cache(&self) -> Vec<Option<bool>> {
        vec![None; self.selectors.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parses_and_evaluates_operators() {
        let l = labels(&[("app", "web"), ("tier", "frontend"), ("projectcalico.org/name", "ns1")]);
        for (sel, want) in [
            ("", true),
            ("all()", true),
            ("global()", false),
            ("has(app)", true),
            ("!has(app)", false),
            ("app == 'web'", true),
            ("app == \"db\"", false),
            ("app != 'db'", true),
            ("missing != 'x'", true),
            ("app in {'web', 'db'}", true),
            ("app not in {'web'}", false),
            ("missing not in {'web'}", true),
            ("app == 'web' && tier == 'backend'", false),
            ("app == 'db' || tier == 'frontend'", true),
            ("!(app == 'db') && has(tier)", true),
            ("projectcalico.org/name == 'ns1'", true),
        ] {
            let parsed = Selector::parse(sel).unwrap_or_else(|e| panic!("{sel}: {e}"));
            assert_eq!(parsed.evaluate(&l), want, "{sel}");
        }
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let s = Selector::parse("a == '1' || b == '2' && c == '3'").unwrap();
        assert!(s.evaluate(&labels(&[("a", "1")])));
        assert!(!s.evaluate(&labels(&[("b", "2")])));
    }

    #[test]
    fn rejects_malformed_selectors() {
        for sel in ["app ==", "app = 'x'", "has(app", "app in {'a'", "(app == 'x'", "foo()", "app == 'x' extra"] {
            assert!(
                matches!(Selector::parse(sel), Err(FlowsimError::InvalidSelector { .. })),
                "{sel} should be rejected"
            );
        }
    }

    #[test]
    fn identical_selectors_share_an_id() {
        let mut h = EndpointSelectorHandler::new();
        let a = h.get_selector_matcher("app == 'web'").unwrap();
        let b = h.get_selector_matcher(" app == 'web' ").unwrap();
        let c = h.get_selector_matcher("all()").unwrap();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(h.create_selector_cache().len(), 2);
    }

    #[test]
    fn cached_results_are_reused() {
        let mut h = EndpointSelectorHandler::new();
        let m = h.get_selector_matcher("app == 'web'").unwrap();
        let mut cache = h.create_selector_cache();
        assert!(m.evaluate_cached(&labels(&[("app", "web")]), &mut cache));
        assert_eq!(cache[m.id()], Some(true));
        // The cached value wins even if different labels are supplied.
        assert!(m.evaluate_cached(&labels(&[]), &mut cache));
    }
}
