use anyhow::{anyhow, Result};
use indexmap::IndexMap;

/// Field selection bits for observer output.
pub mod flags {
    pub const FRAME: u64 = 1 << 0;
    pub const FRAME_ID: u64 = 1 << 1;
    pub const FRAME_END: u64 = 1 << 2;
    pub const TIMESTAMP: u64 = 1 << 3;
    pub const ID: u64 = 1 << 4;
    pub const NUM_OBJECTS: u64 = 1 << 5;
    pub const OBJECTS: u64 = 1 << 6;
    pub const OBJECT: u64 = 1 << 7;
    pub const POSITION: u64 = 1 << 8;
    pub const POS_X: u64 = 1 << 9;
    pub const POS_Y: u64 = 1 << 10;
    pub const POS_Z: u64 = 1 << 11;
    pub const SIZE: u64 = 1 << 12;
    pub const TYPE: u64 = 1 << 13;
    pub const ENTER: u64 = 1 << 14;
    pub const MOVE: u64 = 1 << 15;
    pub const LEAVE: u64 = 1 << 16;
    pub const ENTER_EDGE: u64 = 1 << 17;
    pub const LEAVE_EDGE: u64 = 1 << 18;
    pub const ENTER_COUNT: u64 = 1 << 19;
    pub const LEAVE_COUNT: u64 = 1 << 20;
    pub const GATE_COUNT: u64 = 1 << 21;
    pub const LIFESPAN: u64 = 1 << 22;
    pub const AVG_LIFESPAN: u64 = 1 << 23;
    pub const START: u64 = 1 << 24;
    pub const STOP: u64 = 1 << 25;
    pub const ACTION: u64 = 1 << 26;
    pub const COUNT: u64 = 1 << 27;
    pub const SWITCH: u64 = 1 << 28;
    pub const SWITCH_DURATION: u64 = 1 << 29;
    pub const ALIVE: u64 = 1 << 30;
    pub const OPERATIONAL: u64 = 1 << 31;
    pub const RESET: u64 = 1 << 32;
    pub const REGIONS: u64 = 1 << 33;
    pub const REGION: u64 = 1 << 34;
    pub const UUID: u64 = 1 << 35;
    pub const REGION_X: u64 = 1 << 36;
    pub const REGION_Y: u64 = 1 << 37;
    pub const REGION_WIDTH: u64 = 1 << 38;
    pub const REGION_HEIGHT: u64 = 1 << 39;
    pub const RUN_MODE: u64 = 1 << 40;
    pub const STATISTICS: u64 = 1 << 41;
}

pub mod keys {
    pub const FRAME: &str = "frame";
    pub const FRAME_ID: &str = "frame_id";
    pub const FRAME_END: &str = "frame_end";
    pub const TIMESTAMP: &str = "timestamp";
    pub const ID: &str = "id";
    pub const OBJECTS: &str = "objects";
    pub const OBJECT: &str = "object";
    pub const POSITION: &str = "position";
    pub const X: &str = "x";
    pub const Y: &str = "y";
    pub const Z: &str = "z";
    pub const SIZE: &str = "size";
    pub const TYPE: &str = "type";
    pub const ENTER: &str = "enter";
    pub const MOVE: &str = "move";
    pub const LEAVE: &str = "leave";
    pub const ENTER_EDGE: &str = "enteredge";
    pub const LEAVE_EDGE: &str = "leaveedge";
    pub const ENTER_COUNT: &str = "gateentercount";
    pub const LEAVE_COUNT: &str = "gateleavecount";
    pub const GATE_COUNT: &str = "gatecount";
    pub const LIFESPAN: &str = "lifespan";
    pub const AVG_LIFESPAN: &str = "avglifespan";
    pub const START: &str = "start";
    pub const STOP: &str = "stop";
    pub const ACTION: &str = "action";
    pub const COUNT: &str = "count";
    pub const SWITCH: &str = "switch";
    pub const SWITCH_DURATION: &str = "switchduration";
    pub const ALIVE: &str = "alive";
    pub const OPERATIONAL: &str = "operational";
    pub const RESET: &str = "reset";
    pub const REGIONS: &str = "regions";
    pub const REGION: &str = "region";
    pub const UUID: &str = "uuid";
    pub const REGION_X: &str = "region_x";
    pub const REGION_Y: &str = "region_y";
    pub const REGION_WIDTH: &str = "region_width";
    pub const REGION_HEIGHT: &str = "region_height";
    pub const RUN_MODE: &str = "runmode";
    pub const STATISTICS: &str = "statistics";
}

/// Bitmap of named output fields with per-field alias renames, parsed from
/// the `"name[=alias],name,..."` filter syntax. An empty bitmap means
/// everything is enabled.
#[derive(Debug, Clone)]
pub struct ObsvFilter {
    pub filter: u64,
    key_map: IndexMap<&'static str, String>,
    flag_map: IndexMap<&'static str, u64>,
}

impl Default for ObsvFilter {
    fn default() -> Self {
        let mut filter = ObsvFilter {
            filter: 0,
            key_map: IndexMap::new(),
            flag_map: IndexMap::new(),
        };
        let entries: &[(&'static str, u64)] = &[
            (keys::FRAME, flags::FRAME),
            (keys::FRAME_ID, flags::FRAME_ID),
            (keys::FRAME_END, flags::FRAME_END),
            (keys::TIMESTAMP, flags::TIMESTAMP),
            (keys::ID, flags::ID),
            (keys::OBJECTS, flags::OBJECTS),
            (keys::OBJECT, flags::OBJECT),
            (keys::POSITION, flags::POSITION),
            (keys::X, flags::POS_X),
            (keys::Y, flags::POS_Y),
            (keys::Z, flags::POS_Z),
            (keys::SIZE, flags::SIZE),
            (keys::TYPE, flags::TYPE),
            (keys::ENTER, flags::ENTER),
            (keys::MOVE, flags::MOVE),
            (keys::LEAVE, flags::LEAVE),
            (keys::ENTER_EDGE, flags::ENTER_EDGE),
            (keys::LEAVE_EDGE, flags::LEAVE_EDGE),
            (keys::ENTER_COUNT, flags::ENTER_COUNT),
            (keys::LEAVE_COUNT, flags::LEAVE_COUNT),
            (keys::GATE_COUNT, flags::GATE_COUNT),
            (keys::LIFESPAN, flags::LIFESPAN),
            (keys::AVG_LIFESPAN, flags::AVG_LIFESPAN),
            (keys::START, flags::START),
            (keys::STOP, flags::STOP),
            (keys::ACTION, flags::ACTION),
            (keys::COUNT, flags::COUNT),
            (keys::SWITCH, flags::SWITCH),
            (keys::SWITCH_DURATION, flags::SWITCH_DURATION),
            (keys::ALIVE, flags::ALIVE),
            (keys::OPERATIONAL, flags::OPERATIONAL),
            (keys::RESET, flags::RESET),
            (keys::REGIONS, flags::REGIONS),
            (keys::REGION, flags::REGION),
            (keys::UUID, flags::UUID),
            (keys::REGION_X, flags::REGION_X),
            (keys::REGION_Y, flags::REGION_Y),
            (keys::REGION_WIDTH, flags::REGION_WIDTH),
            (keys::REGION_HEIGHT, flags::REGION_HEIGHT),
            (keys::RUN_MODE, flags::RUN_MODE),
            (keys::STATISTICS, flags::STATISTICS),
        ];
        for (name, flag) in entries {
            filter.key_map.insert(*name, name.to_string());
            filter.flag_map.insert(*name, *flag);
        }
        filter
    }
}

impl ObsvFilter {
    /// `"name[=alias],name,..."`. Unknown names are a configuration error.
    pub fn parse(&mut self, filter: &str) -> Result<()> {
        self.filter = 0;
        for part in filter.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, alias) = match part.split_once('=') {
                Some((key, alias)) => (key.trim(), Some(alias.trim())),
                None => (part, None),
            };
            let flag = *self
                .flag_map
                .get(key)
                .ok_or_else(|| anyhow!("unknown filter field '{key}'"))?;
            if let Some(alias) = alias {
                if let Some(entry) = self.key_map.get_mut(key) {
                    *entry = alias.to_string();
                }
            }
            self.filter |= flag;
        }
        Ok(())
    }

    pub fn enabled(&self, flag: u64) -> bool {
        self.filter == 0 || self.filter & flag != 0
    }

    /// Output name for a canonical field, honouring `=alias` renames.
    pub fn alias<'a>(&'a self, key: &'a str) -> &'a str {
        self.key_map
            .get(key)
            .map(|s| s.as_str())
            .unwrap_or(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_enables_everything() {
        let filter = ObsvFilter::default();
        assert!(filter.enabled(flags::POS_X));
        assert!(filter.enabled(flags::SWITCH));
    }

    #[test]
    fn parse_restricts_fields() {
        let mut filter = ObsvFilter::default();
        filter.parse("x,y,id").unwrap();
        assert!(filter.enabled(flags::POS_X));
        assert!(filter.enabled(flags::ID));
        assert!(!filter.enabled(flags::SIZE));
        assert!(!filter.enabled(flags::TIMESTAMP));
    }

    #[test]
    fn alias_renames_output_key() {
        let mut filter = ObsvFilter::default();
        filter.parse("timestamp=ts,x").unwrap();
        assert_eq!(filter.alias(keys::TIMESTAMP), "ts");
        assert_eq!(filter.alias(keys::X), "x");
    }

    #[test]
    fn unknown_field_is_an_error() {
        let mut filter = ObsvFilter::default();
        assert!(filter.parse("bogus").is_err());
    }
}
