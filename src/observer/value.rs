use super::filter::{keys, ObsvFilter};
use super::{ObsvStatus, RectObject, RectObjects};

/// A resolved field value on its way into a message.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Int32(i32),
    Float(f32),
    Str(String),
}

impl Value {
    pub fn as_string(&self) -> String {
        match self {
            Value::Int(v) => v.to_string(),
            Value::Int32(v) => v.to_string(),
            Value::Float(v) => format!("{v}"),
            Value::Str(v) => v.clone(),
        }
    }
}

/// Result of a value getter: the value plus how it behaves over time.
/// `has_update` means the value changed this frame, `has_static` that it is
/// constant, `has_dynamic` that it depends on per-object state.
#[derive(Debug, Clone)]
pub struct ValueResult {
    pub value: Value,
    pub has_update: bool,
    pub has_static: bool,
    pub has_dynamic: bool,
}

impl ValueResult {
    fn literal(value: Value) -> Self {
        ValueResult {
            value,
            has_update: false,
            has_static: false,
            has_dynamic: false,
        }
    }

    fn updating(value: Value, has_update: bool) -> Self {
        ValueResult {
            value,
            has_update,
            has_static: false,
            has_dynamic: true,
        }
    }

    fn fixed(value: Value) -> Self {
        ValueResult {
            value,
            has_update: false,
            has_static: true,
            has_dynamic: false,
        }
    }
}

/// Everything a value getter may look at.
pub struct ValueCtx<'a> {
    pub filter: &'a ObsvFilter,
    pub continuous: bool,
    pub report_distance: f32,
    /// 1 while processing start, 0 while processing stop, -1 otherwise
    pub start_stop_status: i8,
    pub run_mode: &'a str,
    pub timestamp: u64,
    pub objects: Option<&'a RectObjects>,
    pub object: Option<&'a RectObject>,
}

impl<'a> ValueCtx<'a> {
    fn is_moving(&self) -> bool {
        match self.object {
            Some(obj) => {
                (self.continuous || obj.d >= self.report_distance)
                    && obj.status == ObsvStatus::Move
            }
            None => false,
        }
    }
}

/// Resolve one `<field>` placeholder. Unknown names pass through verbatim
/// so free text survives substitution.
pub fn get_value(name: &str, ctx: &ValueCtx) -> ValueResult {
    let alias = ctx.filter.alias(name);
    let objects = ctx.objects;
    let object = ctx.object;

    match name {
        keys::X => ValueResult::updating(
            Value::Float(match (object, objects) {
                (Some(obj), Some(objs)) => (obj.x - objs.center_x) * objs.scale_x,
                _ => 0.0,
            }),
            ctx.is_moving(),
        ),
        keys::Y => ValueResult::updating(
            Value::Float(match (object, objects) {
                (Some(obj), Some(objs)) => (obj.y - objs.center_y) * objs.scale_y,
                _ => 0.0,
            }),
            ctx.is_moving(),
        ),
        keys::Z => ValueResult::updating(Value::Float(0.0), ctx.is_moving()),
        keys::SIZE => ValueResult::updating(
            Value::Float(object.map(|o| o.size).unwrap_or(0.0)),
            ctx.is_moving(),
        ),
        keys::ID => ValueResult::literal(Value::Int32(
            object.map(|o| o.id as i32).unwrap_or_default(),
        )),
        keys::UUID => ValueResult::literal(Value::Str(
            object.map(|o| o.uuid.to_string()).unwrap_or_default(),
        )),
        keys::TYPE => {
            let status = object.map(|o| o.status).unwrap_or(ObsvStatus::Invalid);
            match status {
                ObsvStatus::Move => ValueResult::updating(
                    Value::Str(ctx.filter.alias(keys::MOVE).to_string()),
                    ctx.is_moving(),
                ),
                ObsvStatus::Enter => ValueResult::updating(
                    Value::Str(ctx.filter.alias(keys::ENTER).to_string()),
                    true,
                ),
                _ => ValueResult::updating(
                    Value::Str(ctx.filter.alias(keys::LEAVE).to_string()),
                    true,
                ),
            }
        }
        keys::ENTER => ValueResult::updating(
            Value::Str(alias.to_string()),
            object.map(|o| o.status == ObsvStatus::Enter).unwrap_or(false),
        ),
        keys::MOVE => ValueResult::updating(Value::Str(alias.to_string()), ctx.is_moving()),
        keys::LEAVE => ValueResult::updating(
            Value::Str(alias.to_string()),
            object.map(|o| o.status == ObsvStatus::Leave).unwrap_or(false),
        ),
        keys::ENTER_EDGE => ValueResult::updating(
            Value::Str(object.map(|o| o.edge.as_str().to_string()).unwrap_or_default()),
            object.map(|o| o.status == ObsvStatus::Enter).unwrap_or(false),
        ),
        keys::LEAVE_EDGE => ValueResult::updating(
            Value::Str(object.map(|o| o.edge.as_str().to_string()).unwrap_or_default()),
            object.map(|o| o.status == ObsvStatus::Leave).unwrap_or(false),
        ),
        keys::LIFESPAN => ValueResult::updating(
            Value::Int(object.map(|o| o.lifespan() as i64).unwrap_or_default()),
            object.map(|o| o.status == ObsvStatus::Leave).unwrap_or(false),
        ),
        keys::SWITCH => {
            let (valid, last) = objects
                .map(|o| (o.valid_count, o.last_count))
                .unwrap_or_default();
            ValueResult::updating(
                Value::Int32(i32::from(valid > 0)),
                ctx.continuous || (last > 0) != (valid > 0),
            )
        }
        keys::SWITCH_DURATION => {
            let objs = objects;
            let (valid, last, switch_ts) = objs
                .map(|o| (o.valid_count, o.last_count, o.switch_timestamp))
                .unwrap_or_default();
            let duration = if switch_ts == 0 {
                0
            } else {
                ctx.timestamp.saturating_sub(switch_ts) as i64
            };
            ValueResult::updating(
                Value::Int(duration),
                ctx.continuous || (last > 0 && valid == 0 && switch_ts != 0),
            )
        }
        keys::COUNT => {
            let (valid, last) = objects
                .map(|o| (o.valid_count, o.last_count))
                .unwrap_or_default();
            ValueResult::updating(Value::Int32(valid as i32), ctx.continuous || last != valid)
        }
        keys::ALIVE => ValueResult::updating(Value::Int32(1), true),
        keys::OPERATIONAL => ValueResult::updating(Value::Float(1.0), true),
        keys::REGION | keys::REGIONS => ValueResult::fixed(Value::Str(
            objects.map(|o| o.region.clone()).unwrap_or_default(),
        )),
        keys::RUN_MODE => ValueResult::fixed(Value::Str(ctx.run_mode.to_string())),
        keys::REGION_X => ValueResult::fixed(Value::Float(
            objects
                .map(|o| o.rect_x + o.rect_width / 2.0)
                .unwrap_or_default(),
        )),
        keys::REGION_Y => ValueResult::fixed(Value::Float(
            objects
                .map(|o| o.rect_y + o.rect_height / 2.0)
                .unwrap_or_default(),
        )),
        keys::REGION_WIDTH => ValueResult::fixed(Value::Float(
            objects.map(|o| o.rect_width).unwrap_or_default(),
        )),
        keys::REGION_HEIGHT => ValueResult::fixed(Value::Float(
            objects.map(|o| o.rect_height).unwrap_or_default(),
        )),
        keys::FRAME_ID => ValueResult::fixed(Value::Int(
            objects.map(|o| o.frame_id as i64).unwrap_or_default(),
        )),
        keys::TIMESTAMP => ValueResult::fixed(Value::Int(
            objects.map(|o| o.timestamp as i64).unwrap_or(ctx.timestamp as i64),
        )),
        keys::ENTER_COUNT => {
            let (enter, last) = objects
                .map(|o| (o.enter_count, o.last_enter_count))
                .unwrap_or_default();
            ValueResult::updating(Value::Int32(enter as i32), ctx.continuous || enter != last)
        }
        keys::LEAVE_COUNT => ValueResult::fixed(Value::Int32(
            objects.map(|o| o.leave_count as i32).unwrap_or_default(),
        )),
        keys::GATE_COUNT => ValueResult::fixed(Value::Int32(
            objects.map(|o| o.gate_count as i32).unwrap_or_default(),
        )),
        keys::AVG_LIFESPAN => ValueResult::fixed(Value::Int(
            objects.map(|o| o.avg_lifespan).unwrap_or_default(),
        )),
        keys::ACTION => match ctx.start_stop_status {
            1 => ValueResult::updating(
                Value::Str(ctx.filter.alias(keys::START).to_string()),
                true,
            ),
            0 => ValueResult::updating(
                Value::Str(ctx.filter.alias(keys::STOP).to_string()),
                true,
            ),
            _ => ValueResult {
                value: Value::Str(alias.to_string()),
                has_update: false,
                has_static: false,
                has_dynamic: true,
            },
        },
        keys::START => ValueResult::updating(
            Value::Str(alias.to_string()),
            ctx.start_stop_status == 1,
        ),
        keys::STOP => ValueResult::updating(
            Value::Str(alias.to_string()),
            ctx.start_stop_status == 0,
        ),
        _ => ValueResult::literal(Value::Str(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::filter::ObsvFilter;

    fn ctx<'a>(
        filter: &'a ObsvFilter,
        objects: Option<&'a RectObjects>,
        object: Option<&'a RectObject>,
    ) -> ValueCtx<'a> {
        ValueCtx {
            filter,
            continuous: true,
            report_distance: 0.5,
            start_stop_status: -1,
            run_mode: "",
            timestamp: 1_000,
            objects,
            object,
        }
    }

    #[test]
    fn unknown_names_pass_through() {
        let filter = ObsvFilter::default();
        let result = get_value("whatever", &ctx(&filter, None, None));
        assert_eq!(result.value.as_string(), "whatever");
        assert!(!result.has_update && !result.has_static && !result.has_dynamic);
    }

    #[test]
    fn region_is_static() {
        let filter = ObsvFilter::default();
        let objects = RectObjects {
            region: "stagefront".to_string(),
            ..RectObjects::default()
        };
        let result = get_value(keys::REGION, &ctx(&filter, Some(&objects), None));
        assert!(result.has_static);
        assert!(!result.has_dynamic);
        assert_eq!(result.value.as_string(), "stagefront");
    }

    #[test]
    fn float_values_render_compactly() {
        assert_eq!(Value::Float(2.0).as_string(), "2");
        assert_eq!(Value::Float(0.25).as_string(), "0.25");
    }
}
