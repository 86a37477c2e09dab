use indexmap::IndexMap;

use super::value::{get_value, ValueCtx};
use super::{BaseObserver, ObsvStatus, RectObject, RectObjects};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Always,
}

impl CondOp {
    fn parse(op: &str) -> CondOp {
        match op {
            "==" => CondOp::Eq,
            "!=" => CondOp::Ne,
            "<" => CondOp::Lt,
            "<=" => CondOp::Le,
            ">" => CondOp::Gt,
            ">=" => CondOp::Ge,
            _ => CondOp::Always,
        }
    }

    fn eval(&self, v0: &str, v1: &str) -> bool {
        let unquote = |s: &str| s.trim_matches('"').to_string();
        match self {
            CondOp::Eq => unquote(v0) == unquote(v1),
            CondOp::Ne => unquote(v0) != unquote(v1),
            CondOp::Always => true,
            _ => {
                let (Ok(a), Ok(b)) = (v0.parse::<f64>(), v1.parse::<f64>()) else {
                    return false;
                };
                match self {
                    CondOp::Lt => a < b,
                    CondOp::Le => a <= b,
                    CondOp::Gt => a > b,
                    CondOp::Ge => a >= b,
                    _ => true,
                }
            }
        }
    }
}

/// One message template line: optional condition plus space-joined
/// components with `<field>` placeholders.
#[derive(Debug, Clone)]
pub struct SchemeMessage {
    condition: Option<(String, CondOp, String)>,
    components: Vec<String>,
    pub force_update: bool,
}

/// A named lifecycle point's template lines.
#[derive(Debug, Clone, Default)]
pub struct Scheme {
    pub messages: Vec<SchemeMessage>,
    pub force_update: bool,
}

/// Parse a scheme text: each non-empty line is
/// `(NAME? CONDITION) component component ...` with NAME and CONDITION both
/// optional. Lines named start*/stop* always fire.
pub fn parse_schemes(text: &str) -> IndexMap<String, Scheme> {
    let mut schemes: IndexMap<String, Scheme> = IndexMap::new();

    for raw_line in text.lines() {
        let mut line = raw_line.trim().to_string();
        let mut name = String::new();
        let mut condition = String::new();

        if line.starts_with('(') {
            if let Some(end) = line.find(')') {
                let head = line[1..end].trim().to_string();
                line = line[end + 1..].trim().to_string();
                match head.split_once('?') {
                    Some((n, c)) => {
                        name = n.trim().to_string();
                        condition = c.trim().to_string();
                    }
                    None => name = head,
                }
            }
        }

        let components: Vec<String> = line
            .split_whitespace()
            .map(|c| c.to_string())
            .collect();
        if components.is_empty() {
            continue;
        }

        let scheme = schemes.entry(name.clone()).or_insert_with(|| Scheme {
            messages: Vec::new(),
            force_update: name.starts_with("start") || name.starts_with("stop"),
        });

        let parsed_condition = {
            let parts: Vec<&str> = condition.split_whitespace().collect();
            if parts.len() == 3 {
                Some((
                    parts[0].to_string(),
                    CondOp::parse(parts[1]),
                    parts[2].to_string(),
                ))
            } else {
                None
            }
        };

        let force_update = scheme.force_update;
        scheme.messages.push(SchemeMessage {
            condition: parsed_condition,
            components,
            force_update,
        });
    }

    schemes
}

struct SubstFlags {
    has_update: bool,
    has_static: bool,
    has_dynamic: bool,
}

impl SubstFlags {
    fn new() -> Self {
        SubstFlags {
            has_update: false,
            has_static: false,
            has_dynamic: false,
        }
    }

    fn fires(&self) -> bool {
        self.has_update || (self.has_static && !self.has_dynamic)
    }
}

/// Replace every `<field>` in `component` via the value registry,
/// accumulating the update/static/dynamic flags of all substituted fields.
fn substitute(component: &str, ctx: &ValueCtx, flags: &mut SubstFlags) -> String {
    let mut result = String::new();
    let mut rest = component;

    while let Some(start) = rest.find('<') {
        result.push_str(&rest[..start]);
        match rest[start + 1..].find('>') {
            Some(end) => {
                let key = &rest[start + 1..start + 1 + end];
                let value = get_value(key, ctx);
                flags.has_update |= value.has_update;
                flags.has_static |= value.has_static;
                flags.has_dynamic |= value.has_dynamic;
                result.push_str(&value.value.as_string());
                rest = &rest[start + 1 + end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

fn condition_holds(message: &SchemeMessage, ctx: &ValueCtx) -> bool {
    let Some((lhs, op, rhs)) = &message.condition else {
        return true;
    };
    let mut flags = SubstFlags::new();
    let v0 = substitute(lhs, ctx, &mut flags);
    if !flags.fires() {
        return false;
    }
    let v1 = substitute(rhs, ctx, &mut flags);
    flags.fires() && op.eval(&v0, &v1)
}

/// Evaluate one scheme against a context, appending fired lines to `out`.
fn fire_scheme(scheme: &Scheme, ctx: &ValueCtx, out: &mut Vec<String>) {
    for message in scheme.messages.iter() {
        if !condition_holds(message, ctx) {
            continue;
        }
        let mut flags = SubstFlags::new();
        let mut msg = String::new();
        for component in message.components.iter() {
            let part = substitute(component, ctx, &mut flags);
            if !part.is_empty() {
                if !msg.is_empty() {
                    msg.push(' ');
                }
                msg.push_str(&part);
            }
        }
        if flags.fires() || message.force_update {
            out.push(msg);
        }
    }
}

fn make_ctx<'a>(
    base: &'a BaseObserver,
    objects: Option<&'a RectObjects>,
    object: Option<&'a RectObject>,
) -> ValueCtx<'a> {
    ValueCtx {
        filter: &base.filter,
        continuous: base.options.continuous,
        report_distance: base.options.report_distance,
        start_stop_status: base.start_stop_status,
        run_mode: &base.options.run_mode,
        timestamp: base.timestamp,
        objects,
        object,
    }
}

/// Run all frame/object lifecycle schemes over the observer's regions.
pub fn report_schemes(base: &mut BaseObserver) -> Vec<String> {
    let mut messages = Vec::new();
    let mut moved: Vec<(usize, u32)> = Vec::new();

    for i in (0..base.rects.num_rects()).rev() {
        let objects = &base.rects.rect(i).objects;

        if let Some(scheme) = base.schemes.get("frame_begin") {
            fire_scheme(scheme, &make_ctx(base, Some(objects), None), &mut messages);
        }

        if let Some(scheme) = base.schemes.get("objects_begin") {
            for obj in objects.objects.values() {
                fire_scheme(scheme, &make_ctx(base, Some(objects), Some(obj)), &mut messages);
            }
        }

        for obj in objects.objects.values() {
            let ctx = make_ctx(base, Some(objects), Some(obj));

            if let Some(scheme) = base.schemes.get("object") {
                fire_scheme(scheme, &ctx, &mut messages);
            }
            let status_scheme = match obj.status {
                ObsvStatus::Enter => base.schemes.get("objectEnter"),
                ObsvStatus::Move => base.schemes.get("objectMove"),
                ObsvStatus::Leave => base.schemes.get("objectLeave"),
                ObsvStatus::Invalid => None,
            };
            if let Some(scheme) = status_scheme {
                fire_scheme(scheme, &ctx, &mut messages);
            }

            let report_move = obj.status == ObsvStatus::Move
                && (base.options.continuous || obj.d >= base.options.report_distance);
            if report_move {
                moved.push((i, obj.id));
            }
        }

        if let Some(scheme) = base.schemes.get("objects_end") {
            for obj in objects.objects.values() {
                fire_scheme(scheme, &make_ctx(base, Some(objects), Some(obj)), &mut messages);
            }
        }

        if let Some(scheme) = base.schemes.get("frame_end") {
            fire_scheme(scheme, &make_ctx(base, Some(objects), None), &mut messages);
        }
    }

    for (i, id) in moved {
        if let Some(obj) = base.rects.rect_mut(i).objects.objects.get_mut(&id) {
            obj.move_done();
        }
    }

    messages
}

/// Fire a single named scheme (start/stop) against the first region.
pub fn report_named_scheme(base: &BaseObserver, name: &str) -> Vec<String> {
    let mut messages = Vec::new();
    if let Some(scheme) = base.schemes.get(name) {
        let objects = &base.rects.rect(0).objects;
        fire_scheme(scheme, &make_ctx(base, Some(objects), None), &mut messages);
    }
    messages
}
