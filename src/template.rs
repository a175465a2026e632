//! Template rendering for printable documents
//!
//! Templates use Jinja syntax (conditionals, loops, `set`, macros) with two
//! additions:
//!
//! - `{% data "name" %}{"some": "json"}{% enddata %}` parses its body as JSON
//!   and binds the result to `name` for the rest of the template, including
//!   when the block sits inside a loop or macro. A body that is not valid
//!   JSON binds nothing and does not fail the render.
//! - `markdown` / `markdowni` filters turn Markdown into HTML that is not
//!   escaped again.
//!
//! The environment is built once and shared; rendering keeps no state between
//! calls.

use crate::dither::DITHER_SCRIPT;
use minijinja::value::Object;
use minijinja::{
    AutoEscape, Environment, Error as JinjaError, ErrorKind, UndefinedBehavior, Value,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

/// Returned by [`TemplateRenderer::try_render`] when rendering fails
pub const TEMPLATE_ERROR_PLACEHOLDER: &str = "Template error...";

const DATA_FILTER: &str = "__data";
const DATA_STORE_VAR: &str = "__data_store";

static ERROR_LOCATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m).*\[Line (\d+), Column (\d+)\].*\n[ \t]*(.*)$").expect("valid regex")
});

static DATA_OPEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"\{%(-?)\s*data\s+(?:"([A-Za-z_][A-Za-z0-9_]*)"|'([A-Za-z_][A-Za-z0-9_]*)'|([A-Za-z_][A-Za-z0-9_]*))\s*(-?)%\}"#,
    )
    .expect("valid regex")
});

static DATA_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{%(-?)\s*enddata\s*(-?)%\}").expect("valid regex"));

/// Location and description of a template failure
///
/// This is the shape editor tooling consumes to place gutter markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateError {
    pub line: usize,
    pub column: usize,
    pub error: String,
}

#[derive(Debug, Clone, Error)]
pub enum TemplateRenderError {
    /// Syntax or directive error with a known position
    #[error("Template render error: [Line {}, Column {}]\n  {}", .0.line, .0.column, .0.error)]
    Parse(TemplateError),

    /// Failure without a source position
    #[error("Template render error: {0}")]
    Render(String),
}

impl TemplateRenderError {
    pub fn location(&self) -> Option<&TemplateError> {
        match self {
            TemplateRenderError::Parse(err) => Some(err),
            TemplateRenderError::Render(_) => None,
        }
    }
}

/// Extract `{line, column, error}` from an error message
///
/// The message must contain a `[Line N, Column M]` marker followed by a line
/// holding the description. Anything else yields `None`.
///
/// ```rust
/// use print_endpoint::parse_error;
///
/// let err = parse_error("(unknown path) [Line 3, Column 7]\n  unexpected token").unwrap();
/// assert_eq!((err.line, err.column), (3, 7));
/// assert_eq!(err.error, "unexpected token");
/// assert!(parse_error("something broke").is_none());
/// ```
pub fn parse_error(message: &str) -> Option<TemplateError> {
    let captures = ERROR_LOCATION.captures(message)?;
    Some(TemplateError {
        line: captures[1].parse().ok()?,
        column: captures[2].parse().ok()?,
        error: captures[3].to_string(),
    })
}

/// Values bound into the template namespace for one render call
#[derive(Debug, Clone, Default, Serialize)]
pub struct RenderContext {
    /// The entry being printed
    pub it: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    /// Additional top-level names
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RenderContext {
    pub fn new(it: serde_json::Value) -> Self {
        Self {
            it,
            ..Default::default()
        }
    }

    /// Build a context from a JSON document
    ///
    /// An object with an `it` key is split into `it`, `images`, `settings`,
    /// `config` and extra names. Anything else becomes `it` as a whole.
    pub fn from_value(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(mut map) if map.contains_key("it") => Self {
                it: map.remove("it").unwrap_or_default(),
                images: map.remove("images"),
                settings: map.remove("settings"),
                config: map.remove("config"),
                extra: map,
            },
            other => Self::new(other),
        }
    }

    pub fn with_images(mut self, images: serde_json::Value) -> Self {
        self.images = Some(images);
        self
    }

    pub fn with_settings(mut self, settings: serde_json::Value) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_value(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }
}

/// Stateless rendering service with a fixed directive and filter set
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        env.set_auto_escape_callback(|_| AutoEscape::Html);
        // none renders as nothing, not as "none"
        env.set_formatter(|out, state, value| {
            if value.is_none() {
                Ok(())
            } else {
                minijinja::escape_formatter(out, state, value)
            }
        });

        env.add_filter("markdown", markdown_filter);
        env.add_filter("markdowni", markdown_inline_filter);
        env.add_filter("json", json_filter);
        env.add_filter(DATA_FILTER, bind_data_filter);

        Self { env }
    }

    /// Render `template` with `context` into final HTML text
    pub fn render(
        &self,
        template: &str,
        context: &RenderContext,
    ) -> Result<String, TemplateRenderError> {
        let expanded = expand_data_directives(template);
        let scope = RenderScope {
            base: Value::from_serialize(context),
            data: Value::from_object(DataStore::default()),
        };
        self.env
            .render_str(&expanded.source, Value::from_object(scope))
            .map_err(|err| to_render_error(template, &expanded, &err))
    }

    /// Render, falling back to [`TEMPLATE_ERROR_PLACEHOLDER`] on any failure
    pub fn try_render(&self, template: &str, context: &RenderContext) -> String {
        self.render(template, context)
            .unwrap_or_else(|_| TEMPLATE_ERROR_PLACEHOLDER.to_string())
    }

    /// Render and append the dither script so the document is ready to print
    pub fn render_document(
        &self,
        template: &str,
        context: &RenderContext,
    ) -> Result<String, TemplateRenderError> {
        let mut html = self.render(template, context)?;
        html.push_str(DITHER_SCRIPT);
        Ok(html)
    }

    /// Render on the blocking pool and report through one of two callbacks
    ///
    /// The error callback receives the parsed location of the failure, or
    /// `None` when the failure carries no `[Line N, Column M]` marker.
    pub async fn render_async<S, E>(
        self: &Arc<Self>,
        template: String,
        context: RenderContext,
        success: S,
        error: E,
    ) where
        S: FnOnce(String) + Send + 'static,
        E: FnOnce(Option<TemplateError>) + Send + 'static,
    {
        let renderer = Arc::clone(self);
        let result =
            tokio::task::spawn_blocking(move || renderer.render(&template, &context)).await;

        match result {
            Ok(Ok(html)) => success(html),
            Ok(Err(err)) => error(parse_error(&err.to_string())),
            Err(join_err) => {
                debug!("template render task failed: {}", join_err);
                error(None)
            }
        }
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

/// Root namespace of one render: the caller's context plus names bound by
/// `{% data %}` blocks, which stay visible wherever the block ran
#[derive(Debug)]
struct RenderScope {
    base: Value,
    data: Value,
}

impl Object for RenderScope {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let name = key.as_str()?;
        if name == DATA_STORE_VAR {
            return Some(self.data.clone());
        }
        if let Some(bound) = self
            .data
            .downcast_object_ref::<DataStore>()
            .and_then(|store| store.get(name))
        {
            return Some(bound);
        }
        self.base
            .get_attr(name)
            .ok()
            .filter(|value| !value.is_undefined())
    }
}

#[derive(Debug, Default)]
struct DataStore(Mutex<BTreeMap<String, Value>>);

impl DataStore {
    fn get(&self, name: &str) -> Option<Value> {
        self.0.lock().ok()?.get(name).cloned()
    }

    fn insert(&self, name: String, value: Value) {
        if let Ok(mut values) = self.0.lock() {
            values.insert(name, value);
        }
    }
}

impl Object for DataStore {}

/// Rewritten template source and the map back to the caller's offsets
struct ExpandedSource {
    source: String,
    segments: Vec<Segment>,
    original_len: usize,
}

/// A run of rewritten source; verbatim runs map byte for byte, generated
/// runs map to the start of the directive they replace
struct Segment {
    start: usize,
    len: usize,
    original_start: usize,
    verbatim: bool,
}

impl ExpandedSource {
    fn push(&mut self, text: &str, original_start: usize, verbatim: bool) {
        if text.is_empty() {
            return;
        }
        self.segments.push(Segment {
            start: self.source.len(),
            len: text.len(),
            original_start,
            verbatim,
        });
        self.source.push_str(text);
    }

    /// Byte offset in the caller's template for an offset in the rewrite
    fn original_offset(&self, offset: usize) -> usize {
        match self
            .segments
            .iter()
            .find(|segment| offset < segment.start + segment.len)
        {
            Some(segment) if segment.verbatim => {
                segment.original_start + offset.saturating_sub(segment.start)
            }
            Some(segment) => segment.original_start,
            None => self.original_len,
        }
    }
}

/// Rewrite `{% data name %}…{% enddata %}` blocks into filter blocks that
/// parse the body and bind it in the root namespace. Generated text holds
/// no newlines, so line numbers are unaffected.
fn expand_data_directives(template: &str) -> ExpandedSource {
    let mut out = ExpandedSource {
        source: String::with_capacity(template.len()),
        segments: Vec::new(),
        original_len: template.len(),
    };
    let mut pos = 0;

    while let Some(open) = DATA_OPEN.captures_at(template, pos) {
        let Some(open_match) = open.get(0) else { break };
        let Some(close) = DATA_CLOSE.captures_at(template, open_match.end()) else {
            break;
        };
        let Some(close_match) = close.get(0) else { break };

        let name = open
            .get(2)
            .or_else(|| open.get(3))
            .or_else(|| open.get(4))
            .map(|m| m.as_str())
            .unwrap_or_default();

        out.push(&template[pos..open_match.start()], pos, true);
        out.push(
            &format!(
                "{{%{} filter {}({}, \"{}\") {}%}}",
                &open[1], DATA_FILTER, DATA_STORE_VAR, name, &open[5]
            ),
            open_match.start(),
            false,
        );
        out.push(
            &template[open_match.end()..close_match.start()],
            open_match.end(),
            true,
        );
        out.push(
            &format!("{{%{} endfilter {}%}}", &close[1], &close[2]),
            close_match.start(),
            false,
        );

        pos = close_match.end();
    }

    out.push(&template[pos..], pos, true);
    out
}

fn to_render_error(
    template: &str,
    expanded: &ExpandedSource,
    err: &JinjaError,
) -> TemplateRenderError {
    let message = match err.detail() {
        Some(detail) => format!("{}: {}", err.kind(), detail),
        None => err.kind().to_string(),
    };

    match err.line() {
        Some(line) => {
            let column = err
                .range()
                .map(|range| column_of(template, expanded.original_offset(range.start)))
                .unwrap_or(1);
            TemplateRenderError::Parse(TemplateError {
                line,
                column,
                error: message,
            })
        }
        None => TemplateRenderError::Render(message),
    }
}

/// 1-based column of a byte offset
fn column_of(source: &str, offset: usize) -> usize {
    let mut offset = offset.min(source.len());
    while !source.is_char_boundary(offset) {
        offset -= 1;
    }
    let line_start = source[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
    source[line_start..offset].chars().count() + 1
}

/// Filter behind `{% data %}`: binds the parsed body under `name` and
/// renders nothing
///
/// The store is passed by name in the generated tag so macros capture it
/// like any other root variable.
fn bind_data_filter(body: String, store: Value, name: String) -> Value {
    match serde_json::from_str::<serde_json::Value>(body.trim()) {
        Ok(parsed) => match store.downcast_object_ref::<DataStore>() {
            Some(store) => store.insert(name, Value::from_serialize(&parsed)),
            None => debug!("no data store in scope for {}", name),
        },
        Err(err) => debug!("ignoring embedded data block with invalid JSON: {}", err),
    }
    Value::from("")
}

fn markdown_filter(markdown: String) -> Value {
    Value::from_safe_string(render_markdown(&markdown))
}

fn markdown_inline_filter(markdown: String) -> Value {
    Value::from_safe_string(render_markdown_inline(&markdown))
}

fn json_filter(value: Value) -> Result<Value, JinjaError> {
    serde_json::to_string(&value)
        .map(Value::from_safe_string)
        .map_err(|e| JinjaError::new(ErrorKind::InvalidOperation, e.to_string()))
}

pub fn render_markdown(markdown: &str) -> String {
    let parser = pulldown_cmark::Parser::new_ext(markdown, pulldown_cmark::Options::all());
    let mut html = String::with_capacity(markdown.len() * 3 / 2);
    pulldown_cmark::html::push_html(&mut html, parser);
    html
}

/// Markdown for use inside a line: no wrapping paragraph
pub fn render_markdown_inline(markdown: &str) -> String {
    let html = render_markdown(markdown);
    let trimmed = html.trim_end_matches('\n');
    match trimmed
        .strip_prefix("<p>")
        .and_then(|inner| inner.strip_suffix("</p>"))
    {
        Some(inner) if !inner.contains("<p>") => inner.to_string(),
        _ => html,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(template: &str, it: serde_json::Value) -> Result<String, TemplateRenderError> {
        TemplateRenderer::new().render(template, &RenderContext::new(it))
    }

    #[test]
    fn test_static_text_passes_through() {
        let template = "<div id=\"content\">\n  Plain text & <b>markup</b>\n</div>\n";
        assert_eq!(render(template, json!({})).unwrap(), template);
    }

    #[test]
    fn test_interpolation_escapes_html() {
        let out = render("{{ it.name }}", json!({"name": "Orc <3 & co"})).unwrap();
        assert_eq!(out, "Orc &lt;3 &amp; co");
    }

    #[test]
    fn test_control_flow() {
        let template = "{% for m in it.monsters %}{% if m.hp > 5 %}{{ m.name }};{% endif %}{% endfor %}";
        let out = render(
            template,
            json!({"monsters": [{"name": "Orc", "hp": 15}, {"name": "Rat", "hp": 2}]}),
        )
        .unwrap();
        assert_eq!(out, "Orc;");
    }

    #[test]
    fn test_macros_and_set() {
        let template = "{% macro stat(n, v) %}{{ n }}={{ v }}{% endmacro %}{% set x = 3 %}{{ stat('str', x) }}";
        assert_eq!(render(template, json!({})).unwrap(), "str=3");
    }

    #[test]
    fn test_data_directive_binds_json() {
        let template = "{% data \"x\" %}{\"a\":1}{% enddata %}{{ x.a }}";
        assert_eq!(render(template, json!({})).unwrap(), "1");
    }

    #[test]
    fn test_data_directive_bare_name() {
        let template = "{% data loot %}[\"gold\", \"gem\"]{% enddata %}{{ loot | join(',') }}";
        assert_eq!(render(template, json!({})).unwrap(), "gold,gem");
    }

    #[test]
    fn test_data_directive_malformed_json_is_ignored() {
        let template = "{% data \"x\" %}{not json{% enddata %}{% if x is defined %}bound{% else %}unbound{% endif %}";
        assert_eq!(render(template, json!({})).unwrap(), "unbound");
    }

    #[test]
    fn test_data_directive_binds_from_inside_loop() {
        let template = "{% for i in [1] %}{% data \"x\" %}{\"a\":1}{% enddata %}{% endfor %}[{{ x.a }}]";
        assert_eq!(render(template, json!({})).unwrap(), "[1]");
    }

    #[test]
    fn test_data_directive_binds_from_inside_macro() {
        let template = "{% macro load() %}{% data \"x\" %}{\"a\":2}{% enddata %}{% endmacro %}{{ load() }}{{ x.a }}";
        assert_eq!(render(template, json!({})).unwrap(), "2");
    }

    #[test]
    fn test_data_directive_does_not_shadow_later_blocks() {
        let template = "{% data \"x\" %}{\"a\":1}{% enddata %}{% data \"x\" %}{\"a\":2}{% enddata %}{{ x.a }}";
        assert_eq!(render(template, json!({})).unwrap(), "2");
    }

    #[test]
    fn test_data_directive_keeps_columns() {
        let tail = "{{ it.a | }}";
        let prefix = "{% data \"x\" %}{\"a\":1}{% enddata %}";

        let plain = render(tail, json!({})).unwrap_err();
        let shifted = render(&format!("{}{}", prefix, tail), json!({})).unwrap_err();

        let plain = plain.location().cloned().expect("location");
        let shifted = shifted.location().cloned().expect("location");
        assert_eq!(shifted.line, 1);
        assert_eq!(shifted.column, plain.column + prefix.len());
    }

    #[test]
    fn test_column_inside_data_tag_points_at_directive() {
        let expanded = expand_data_directives("ab{% data x %}1{% enddata %}cd");
        assert_eq!(expanded.original_offset(0), 0);
        // generated tag text maps to where the directive starts
        assert_eq!(expanded.original_offset(3), 2);
        let body = expanded.source.find('1').unwrap();
        assert_eq!(expanded.original_offset(body), 14);
        assert_eq!(expanded.original_offset(expanded.source.len() - 1), 29);
        assert_eq!(expanded.original_offset(expanded.source.len() + 5), 30);
    }

    #[test]
    fn test_data_directive_keeps_line_numbers() {
        let template = "{% data \"x\" %}{\"a\":1}{% enddata %}\nline two\n{{ x.a | nope }}";
        let err = render(template, json!({})).unwrap_err();
        assert_eq!(err.location().map(|l| l.line), Some(3));
    }

    #[test]
    fn test_markdown_is_not_escaped() {
        let out = render("{{ it.text | markdown }}", json!({"text": "**bold**"})).unwrap();
        assert_eq!(out, "<p><strong>bold</strong></p>\n");

        let out = render("{{ it.text | markdowni }}", json!({"text": "*hi*"})).unwrap();
        assert_eq!(out, "<em>hi</em>");
    }

    #[test]
    fn test_json_filter() {
        let out = render("{{ it | json }}", json!({"a": [1, 2]})).unwrap();
        assert_eq!(out, r#"{"a":[1,2]}"#);
    }

    #[test]
    fn test_syntax_error_has_location() {
        let err = render("line one\n{% if %}", json!({})).unwrap_err();
        let location = err.location().cloned().expect("location");
        assert_eq!(location.line, 2);
        assert!(location.column >= 1);

        // The message round-trips through the extraction used by tooling.
        assert_eq!(parse_error(&err.to_string()), Some(location));
    }

    #[test]
    fn test_parse_error_contract() {
        let parsed = parse_error("... [Line 3, Column 7] ...\n  unexpected token").unwrap();
        assert_eq!(
            parsed,
            TemplateError {
                line: 3,
                column: 7,
                error: "unexpected token".to_string()
            }
        );
        assert_eq!(parse_error("no marker here\n  unexpected token"), None);
    }

    #[test]
    fn test_try_render_placeholder() {
        let renderer = TemplateRenderer::new();
        let out = renderer.try_render("{% for %}", &RenderContext::default());
        assert_eq!(out, TEMPLATE_ERROR_PLACEHOLDER);
    }

    #[test]
    fn test_context_names() {
        let ctx = RenderContext::new(json!({"name": "Bob"}))
            .with_settings(json!({"width": 380}))
            .with_images(json!({"logo": "logo.png"}))
            .with_value("extra", json!("yes"));
        let out = TemplateRenderer::new()
            .render("{{ it.name }} {{ settings.width }} {{ extra }} {{ images.logo }}", &ctx)
            .unwrap();
        assert_eq!(out, "Bob 380 yes logo.png");
    }

    #[test]
    fn test_context_from_value() {
        let ctx = RenderContext::from_value(json!({"it": {"n": 1}, "settings": {"w": 2}, "shop": "Inn"}));
        assert_eq!(ctx.it, json!({"n": 1}));
        assert_eq!(ctx.settings, Some(json!({"w": 2})));
        assert_eq!(ctx.extra.get("shop"), Some(&json!("Inn")));

        let ctx = RenderContext::from_value(json!({"name": "Bob"}));
        assert_eq!(ctx.it, json!({"name": "Bob"}));
        assert!(ctx.extra.is_empty());
    }

    #[test]
    fn test_render_document_appends_dither_script() {
        let out = TemplateRenderer::new()
            .render_document("<div id=\"content\"></div>", &RenderContext::default())
            .unwrap();
        assert!(out.starts_with("<div id=\"content\"></div>"));
        assert!(out.ends_with(DITHER_SCRIPT));
    }

    #[tokio::test]
    async fn test_render_async_callbacks() {
        let renderer = Arc::new(TemplateRenderer::new());
        let (tx, rx) = tokio::sync::oneshot::channel();
        renderer
            .render_async(
                "{{ it }}".to_string(),
                RenderContext::new(json!(5)),
                move |html| {
                    let _ = tx.send(Ok(html));
                },
                |_| panic!("render should succeed"),
            )
            .await;
        assert_eq!(rx.await.unwrap(), Ok::<_, ()>("5".to_string()));

        let (tx, rx) = tokio::sync::oneshot::channel();
        renderer
            .render_async(
                "\n{% if %}".to_string(),
                RenderContext::default(),
                |_| panic!("render should fail"),
                move |err| {
                    let _ = tx.send(err);
                },
            )
            .await;
        assert_eq!(rx.await.unwrap().map(|e| e.line), Some(2));
    }
}
