//! Built-in runner for `tessera eval`: text templates over globals.
//!
//! `@name` (and, for script text, `globals.name`) is replaced by the JSON
//! encoding of that global's value. The rendered text must itself be JSON.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

use tessera_pool::{RunKind, TaskRunner, WorkerContext};
use tessera_types::{GlobalsMap, TaskFailure, WorkerId};

struct Placeholders {
    at_name: Regex,
    globals_member: Regex,
}

static PLACEHOLDERS: OnceLock<Placeholders> = OnceLock::new();

fn placeholders() -> &'static Placeholders {
    PLACEHOLDERS.get_or_init(|| Placeholders {
        at_name: Regex::new(r"@([A-Za-z_][A-Za-z0-9_]*)").expect("valid @name regex"),
        globals_member: Regex::new(r"\bglobals\.([A-Za-z_$][A-Za-z0-9_$]*)")
            .expect("valid globals member regex"),
    })
}

fn substitute(re: &Regex, text: &str, globals: &GlobalsMap) -> String {
    re.replace_all(text, |caps: &Captures<'_>| match globals.get(&caps[1]) {
        Some(global) => global.value.to_string(),
        None => caps[0].to_string(),
    })
    .into_owned()
}

/// Replace known placeholders. Unknown names are left as written.
pub fn render(kind: RunKind, text: &str, globals: &GlobalsMap) -> String {
    let p = placeholders();
    let rendered = substitute(&p.at_name, text, globals);
    match kind {
        RunKind::Query => rendered,
        RunKind::Eval => substitute(&p.globals_member, &rendered, globals),
    }
}

pub struct TemplateRunner;

impl TaskRunner for TemplateRunner {
    fn run(
        &mut self,
        kind: RunKind,
        text: &str,
        globals: &GlobalsMap,
        _ctx: &mut WorkerContext<'_>,
    ) -> Result<Value, TaskFailure> {
        let rendered = render(kind, text, globals);
        serde_json::from_str(rendered.trim()).map_err(|err| {
            TaskFailure::new(format!("rendered {} text is not JSON: {err}", kind.as_str()))
                .with_detail(rendered)
        })
    }
}

pub fn factory(_worker: WorkerId) -> Box<dyn TaskRunner> {
    Box::new(TemplateRunner)
}
