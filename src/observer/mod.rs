pub mod callback;
pub mod file;
pub mod filter;
pub mod image;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod net;
pub mod scheme;
pub mod value;

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use indexmap::IndexMap;
use log::{error, info};

use crate::frame::{FrameObject, TrackedFrame};
use crate::sink::MessageWriter;
use crate::track_uuid::TrackUuid;
use crate::util::getmsec;
use filter::{flags, ObsvFilter};
use scheme::Scheme;

/// Threaded observers drain their queue for at most this long on flush.
const FLUSH_TIMEOUT_MSEC: u64 = 2_000;
const QUEUE_POLL_MSEC: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObsvStatus {
    Invalid,
    Enter,
    Move,
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    None,
    Left,
    Right,
    Top,
    Bottom,
}

impl Edge {
    pub fn as_str(&self) -> &'static str {
        match self {
            Edge::None => "none",
            Edge::Left => "left",
            Edge::Right => "right",
            Edge::Top => "top",
            Edge::Bottom => "bottom",
        }
    }

    pub fn from_str(s: &str) -> Edge {
        match s {
            "left" => Edge::Left,
            "right" => Edge::Right,
            "top" => Edge::Top,
            "bottom" => Edge::Bottom,
            _ => Edge::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Rect,
    Ellipse,
}

/// Per-region view of one tracked object, carrying enter/move/leave state
/// and the move-report anchor.
#[derive(Debug, Clone)]
pub struct RectObject {
    pub id: u32,
    pub uuid: TrackUuid,
    pub timestamp: u64,
    pub x: f32,
    pub y: f32,
    pub size: f32,
    /// Position at the previous frame
    pub lx: f32,
    pub ly: f32,
    /// Position at the last reported move
    pub x0: f32,
    pub y0: f32,
    pub size0: f32,
    pub timestamp0: u64,
    /// Distance moved since the last reported move
    pub d: f32,
    pub flags: u16,
    pub status: ObsvStatus,
    pub edge: Edge,
    pub timestamp_enter: u64,
    pub timestamp_touched: u64,
}

impl RectObject {
    fn from_frame_object(object: &FrameObject) -> Self {
        RectObject {
            id: object.id,
            uuid: object.uuid,
            timestamp: object.timestamp,
            x: object.x,
            y: object.y,
            size: object.size,
            lx: f32::NAN,
            ly: f32::NAN,
            x0: object.x,
            y0: object.y,
            size0: object.size,
            timestamp0: object.timestamp,
            d: 0.0,
            flags: object.flags,
            status: ObsvStatus::Enter,
            edge: Edge::None,
            timestamp_enter: object.timestamp,
            timestamp_touched: object.timestamp,
        }
    }

    /// Follow the tracked object, optionally easing towards it.
    fn track(&mut self, other: &FrameObject, smoothing: f32) {
        self.timestamp = other.timestamp;
        if smoothing > 0.0 && !self.x.is_nan() && !self.y.is_nan() {
            let oms = 1.0 - smoothing;
            self.x = smoothing * self.x + oms * other.x;
            self.y = smoothing * self.y + oms * other.y;
            self.size = smoothing * self.size + oms * other.size;
        } else {
            self.x = other.x;
            self.y = other.y;
            self.size = other.size;
        }
    }

    pub fn distance_moved(&self) -> f32 {
        let dx = self.x - self.x0;
        let dy = self.y - self.y0;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn move_done(&mut self) {
        self.timestamp0 = self.timestamp;
        self.x0 = self.x;
        self.y0 = self.y;
        self.size0 = self.size;
        self.d = 0.0;
    }

    fn update(&mut self) {
        self.lx = self.x;
        self.ly = self.y;
    }

    pub fn lifespan(&self) -> u64 {
        self.timestamp_touched.saturating_sub(self.timestamp_enter)
    }
}

/// All objects currently inside one region, plus the region's counters.
#[derive(Debug, Clone, Default)]
pub struct RectObjects {
    pub objects: BTreeMap<u32, RectObject>,
    pub timestamp: u64,
    pub frame_id: u64,
    pub region: String,
    pub valid_count: i64,
    pub last_count: i64,
    pub enter_count: i64,
    pub last_enter_count: i64,
    pub leave_count: i64,
    pub last_leave_count: i64,
    pub gate_count: i64,
    pub last_gate_count: i64,
    pub avg_lifespan: i64,
    pub last_avg_lifespan: i64,
    pub lifespan_sum: u64,
    pub lifespan_count: u64,
    pub switch_timestamp: u64,
    pub switch_duration_sum: u64,
    pub center_x: f32,
    pub center_y: f32,
    pub scale_x: f32,
    pub scale_y: f32,
    pub rect_x: f32,
    pub rect_y: f32,
    pub rect_width: f32,
    pub rect_height: f32,
}

impl RectObjects {
    fn reset_counters(&mut self) {
        self.last_count = -1;
        self.enter_count = 0;
        self.last_enter_count = -1;
        self.leave_count = 0;
        self.last_leave_count = -1;
        self.gate_count = 0;
        self.last_gate_count = -1;
        self.last_avg_lifespan = -1;
        self.avg_lifespan = 0;
        self.lifespan_sum = 0;
        self.lifespan_count = 0;
        self.switch_timestamp = 0;
        self.switch_duration_sum = 0;
        self.valid_count = 0;
    }
}

/// A rectangular or elliptical observation region in world space.
#[derive(Debug, Clone)]
pub struct ObsvRect {
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub invert: bool,
    pub edge: Edge,
    pub shape: Shape,
    pub objects: RectObjects,
}

impl Default for ObsvRect {
    fn default() -> Self {
        ObsvRect {
            name: String::new(),
            x: -3.0,
            y: -3.0,
            width: 6.0,
            height: 6.0,
            invert: false,
            edge: Edge::None,
            shape: Shape::Rect,
            objects: RectObjects::default(),
        }
    }
}

impl ObsvRect {
    pub fn contains(&self, x: f32, y: f32, size: f32) -> bool {
        match self.shape {
            Shape::Rect => {
                x + size >= self.x
                    && x - size <= self.x + self.width
                    && y + size >= self.y
                    && y - size <= self.y + self.height
            }
            Shape::Ellipse => {
                let dx = x - (self.x + 0.5 * self.width);
                let mut dy = y - (self.y + 0.5 * self.height);
                dy *= self.width / self.height;
                (dx * dx + dy * dy).sqrt() <= 0.5 * self.width
            }
        }
    }

    /// Which border an object is closest to, from its last position when
    /// entering and its current one when leaving.
    fn edge_crossed(&self, x: f32, y: f32, lx: f32, ly: f32, status: ObsvStatus) -> Edge {
        let (x, y) = if status == ObsvStatus::Leave || lx.is_nan() {
            (x, y)
        } else {
            (lx, ly)
        };
        if x.is_nan() || y.is_nan() {
            return Edge::None;
        }
        if x.abs() > y.abs() {
            if x < 0.0 {
                Edge::Left
            } else {
                Edge::Right
            }
        } else if y < 0.0 {
            Edge::Bottom
        } else {
            Edge::Top
        }
    }
}

/// The region set of an observer. With no named regions a single default
/// rect applies; naming the default rect while others exist switches to
/// union mode where all rects act as one region.
#[derive(Debug, Clone, Default)]
pub struct ObsvRects {
    pub default_rect: ObsvRect,
    pub rects: Vec<ObsvRect>,
}

impl ObsvRects {
    pub fn unite(&mut self, name: &str) {
        self.default_rect.name = name.to_string();
        self.default_rect.objects.region = name.to_string();
    }

    pub fn num_rects(&self) -> usize {
        if self.default_rect.name.is_empty() && !self.rects.is_empty() {
            self.rects.len()
        } else {
            1
        }
    }

    pub fn rect(&self, i: usize) -> &ObsvRect {
        if self.default_rect.name.is_empty() && !self.rects.is_empty() {
            &self.rects[i]
        } else {
            &self.default_rect
        }
    }

    pub fn rect_mut(&mut self, i: usize) -> &mut ObsvRect {
        if self.default_rect.name.is_empty() && !self.rects.is_empty() {
            &mut self.rects[i]
        } else {
            &mut self.default_rect
        }
    }

    pub fn get(&mut self, name: &str) -> Option<&mut ObsvRect> {
        if !self.default_rect.name.is_empty() && self.default_rect.name == name {
            return Some(&mut self.default_rect);
        }
        self.rects.iter_mut().find(|r| r.name == name)
    }

    pub fn set(
        &mut self,
        name: &str,
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        edge: Edge,
        shape: Shape,
    ) -> &mut ObsvRect {
        if self.get(name).is_none() {
            let mut rect = ObsvRect {
                name: name.to_string(),
                ..ObsvRect::default()
            };
            rect.objects.region = name.to_string();
            self.rects.push(rect);
        }
        let rect = self.get(name).unwrap();
        rect.x = x;
        rect.y = y;
        rect.width = width;
        rect.height = height;
        rect.edge = edge;
        rect.shape = shape;
        rect
    }

    pub fn set_default(&mut self, x: f32, y: f32, width: f32, height: f32) {
        self.default_rect.x = x;
        self.default_rect.y = y;
        self.default_rect.width = width;
        self.default_rect.height = height;
    }

    /// Containment for region `i`; in union mode any rect counts.
    pub fn contains(&self, i: usize, x: f32, y: f32, size: f32) -> bool {
        if self.rects.is_empty() {
            return true;
        }
        let size = size * 0.5;
        if self.default_rect.name.is_empty() {
            let rect = &self.rects[i];
            let contains = rect.contains(x, y, size);
            if rect.invert {
                return !contains;
            }
            return contains;
        }
        for rect in self.rects.iter() {
            if rect.contains(x, y, size) {
                return !rect.invert;
            }
        }
        false
    }

    fn edge_crossed(&self, i: usize, x: f32, y: f32, lx: f32, ly: f32, status: ObsvStatus) -> Edge {
        if !self.default_rect.name.is_empty() && self.rects.len() != 1 {
            return Edge::None;
        }
        let rect = self.rect(i);
        let edge = rect.edge_crossed(x, y, lx, ly, status);
        if rect.edge == Edge::None {
            return edge;
        }
        if edge != rect.edge {
            return Edge::None;
        }
        edge
    }

    fn count_edge(&self, i: usize, edge: Edge) -> i64 {
        if edge == Edge::None || (!self.default_rect.name.is_empty() && self.rects.len() != 1) {
            return 0;
        }
        if edge == self.rect(i).edge {
            1
        } else {
            0
        }
    }

    pub fn reset(&mut self) {
        for i in (0..self.num_rects()).rev() {
            let objects = &mut self.rect_mut(i).objects;
            objects.objects.clear();
            objects.reset_counters();
        }
    }

    pub fn start(&mut self) {
        for i in (0..self.num_rects()).rev() {
            self.rect_mut(i).objects.reset_counters();
        }
    }
}

/// Behavioural switches shared by all observer kinds; concrete observers
/// set their own defaults.
#[derive(Debug, Clone)]
pub struct ObserverOptions {
    pub continuous: bool,
    pub full_frame: bool,
    pub is_json: bool,
    pub is_threaded: bool,
    pub use_latent: bool,
    pub drop_private: bool,
    pub rect_centered: bool,
    pub rect_normalized: bool,
    pub reporting: bool,
    pub max_fps: f32,
    pub smoothing: f32,
    /// Min metres moved before a move is reported (unless continuous)
    pub report_distance: f32,
    pub run_mode: String,
}

impl Default for ObserverOptions {
    fn default() -> Self {
        ObserverOptions {
            continuous: true,
            full_frame: true,
            is_json: false,
            is_threaded: false,
            use_latent: false,
            drop_private: false,
            rect_centered: false,
            rect_normalized: false,
            reporting: true,
            max_fps: 0.0,
            smoothing: 0.0,
            report_distance: 0.5,
            run_mode: String::new(),
        }
    }
}

type QueueItem = (Vec<String>, u64);

enum Output {
    Direct(Box<dyn MessageWriter>),
    Threaded {
        sender: Option<Sender<QueueItem>>,
        handle: Option<thread::JoinHandle<()>>,
    },
}

/// State and behaviour shared by every observer: regions, field filter,
/// scheme engine, message queue and lifecycle flags.
pub struct BaseObserver {
    pub name: String,
    pub options: ObserverOptions,
    pub rects: ObsvRects,
    pub filter: ObsvFilter,
    pub schemes: IndexMap<String, Scheme>,
    pub timestamp: u64,
    pub frame_id: u64,
    pub start_timestamp: u64,
    is_started: bool,
    is_stalled: bool,
    /// 1 while processing start, 0 while processing stop, -1 otherwise
    pub start_stop_status: i8,
    output: Output,
}

impl BaseObserver {
    pub fn new(name: &str, options: ObserverOptions, writer: Box<dyn MessageWriter>) -> Self {
        let output = if options.is_threaded {
            let (sender, receiver) = bounded::<QueueItem>(1024);
            let mut writer = writer;
            let thread_name = format!("obsv-{name}");
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || loop {
                    match receiver.recv_timeout(Duration::from_millis(QUEUE_POLL_MSEC)) {
                        Ok((messages, timestamp)) => {
                            if let Err(e) = writer.write(&messages, timestamp) {
                                error!("{thread_name}: {e}");
                            }
                        }
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    }
                })
                .expect("failed to spawn observer thread");
            Output::Threaded {
                sender: Some(sender),
                handle: Some(handle),
            }
        } else {
            Output::Direct(writer)
        };

        BaseObserver {
            name: name.to_string(),
            options,
            rects: ObsvRects::default(),
            filter: ObsvFilter::default(),
            schemes: IndexMap::new(),
            timestamp: 0,
            frame_id: 0,
            start_timestamp: 0,
            is_started: false,
            is_stalled: false,
            start_stop_status: -1,
            output,
        }
    }

    pub fn is_started(&self) -> bool {
        self.is_started
    }

    pub fn set_scheme(&mut self, text: &str) -> bool {
        self.schemes = scheme::parse_schemes(text);
        !self.schemes.is_empty()
    }

    pub fn has_scheme(&self) -> bool {
        !self.schemes.is_empty()
    }

    /// Hand formatted messages to the writer, queueing when threaded.
    pub fn dispatch(&mut self, messages: Vec<String>, timestamp: u64) {
        if messages.is_empty() {
            return;
        }
        match &mut self.output {
            Output::Direct(writer) => {
                if let Err(e) = writer.write(&messages, timestamp) {
                    error!("observer {}: {e}", self.name);
                }
            }
            Output::Threaded { sender, .. } => {
                if let Some(sender) = sender {
                    let _ = sender.try_send((messages, timestamp));
                }
            }
        }
    }

    /// Wait for a threaded queue to drain, bounded to ~2 s.
    pub fn flush(&mut self) {
        if let Output::Threaded {
            sender: Some(sender),
            ..
        } = &self.output
        {
            let start = getmsec();
            while !sender.is_empty() && getmsec() - start < FLUSH_TIMEOUT_MSEC {
                thread::sleep(Duration::from_millis(QUEUE_POLL_MSEC));
            }
        }
    }

    fn stop_thread(&mut self) {
        if let Output::Threaded { sender, handle } = &mut self.output {
            sender.take();
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
    }

    /// Fold one fused frame into every region and report.
    pub fn observe(&mut self, frame: &TrackedFrame, force: bool) -> bool {
        if !self.is_started || self.is_stalled {
            return false;
        }
        let time_diff = frame.timestamp as i64 - self.timestamp as i64;
        if !force
            && self.options.max_fps > 0.0
            && time_diff > 0
            && 1000.0 / time_diff as f32 > self.options.max_fps
        {
            return false;
        }
        self.timestamp = frame.timestamp;
        self.frame_id = frame.frame_id;

        for i in (0..self.rects.num_rects()).rev() {
            let mut objects = std::mem::take(&mut self.rects.rect_mut(i).objects);
            let region = self.rects.rect(i).name.clone();
            objects.region = region;

            {
                let rect = self.rects.rect(i);
                objects.rect_x = rect.x;
                objects.rect_y = rect.y;
                objects.rect_width = rect.width;
                objects.rect_height = rect.height;
                objects.scale_x = 1.0;
                objects.scale_y = 1.0;
                objects.center_x = 0.0;
                objects.center_y = 0.0;
                if self.options.rect_normalized {
                    objects.center_x = rect.x;
                    objects.center_y = rect.y;
                    objects.scale_x = 1.0 / rect.width;
                    objects.scale_y = 1.0 / rect.height;
                } else if self.options.rect_centered {
                    objects.center_x = rect.x + rect.width / 2.0;
                    objects.center_y = rect.y + rect.height / 2.0;
                }
            }

            objects.timestamp = frame.timestamp;
            objects.frame_id = frame.frame_id;
            objects.last_count = objects.valid_count;
            objects.last_enter_count = objects.enter_count;
            objects.last_leave_count = objects.leave_count;
            objects.last_gate_count = objects.gate_count;
            objects.last_avg_lifespan = objects.avg_lifespan;
            if objects.valid_count == 0 {
                objects.switch_timestamp = 0;
            }

            for obj in objects.objects.values_mut() {
                obj.status = ObsvStatus::Invalid;
            }

            for object in frame.objects.values() {
                if !self.options.use_latent && object.is_latent() {
                    continue;
                }
                if self.options.drop_private && object.is_private() {
                    continue;
                }
                if !self.rects.contains(i, object.x, object.y, 0.0) {
                    continue;
                }

                if !objects.objects.contains_key(&object.id) {
                    let mut obj = RectObject::from_frame_object(object);
                    obj.edge = self.rects.edge_crossed(
                        i,
                        object.x,
                        object.y,
                        f32::NAN,
                        f32::NAN,
                        ObsvStatus::Enter,
                    );
                    objects.enter_count += self.rects.count_edge(i, obj.edge);
                    objects.gate_count = (objects.enter_count - objects.leave_count).max(0);
                    obj.move_done();
                    obj.update();
                    objects.objects.insert(object.id, obj);
                } else if let Some(obj) = objects.objects.get_mut(&object.id) {
                    obj.track(object, self.options.smoothing);
                    obj.d = obj.distance_moved();
                    obj.status = ObsvStatus::Move;
                    obj.edge = Edge::None;
                    obj.flags = object.flags;
                    if object.is_touched() {
                        obj.timestamp_touched = frame.timestamp;
                    }
                }
            }

            let mut invalid_count = 0i64;
            let mut leaves: Vec<u32> = Vec::new();
            for (id, obj) in objects.objects.iter_mut() {
                if obj.status == ObsvStatus::Invalid {
                    obj.move_done();
                    obj.status = ObsvStatus::Leave;
                    leaves.push(*id);
                    invalid_count += 1;
                }
            }
            for id in leaves {
                let (x, y, lx, ly) = {
                    let obj = &objects.objects[&id];
                    // the tracker may still know the object outside the rect
                    match frame.get(id) {
                        Some(known) => (known.x, known.y, f32::NAN, f32::NAN),
                        None => (obj.x, obj.y, obj.lx, obj.ly),
                    }
                };
                let edge = self.rects.edge_crossed(i, x, y, lx, ly, ObsvStatus::Leave);
                let obj = objects.objects.get_mut(&id).unwrap();
                obj.edge = edge;
                objects.leave_count += self.rects.count_edge(i, edge);
                objects.gate_count = (objects.enter_count - objects.leave_count).max(0);

                let lifespan = obj.lifespan();
                objects.lifespan_sum += lifespan;
                objects.lifespan_count += 1;
                objects.avg_lifespan =
                    (objects.lifespan_sum / objects.lifespan_count.max(1)) as i64;
            }

            objects.valid_count = objects.objects.len() as i64 - invalid_count;

            if objects.valid_count > 0 && objects.last_count <= 0 {
                objects.switch_timestamp = objects.timestamp;
            } else if objects.valid_count == 0
                && objects.last_count > 0
                && objects.switch_timestamp > 0
            {
                objects.switch_duration_sum +=
                    objects.timestamp.saturating_sub(objects.switch_timestamp);
            }

            // refresh the last-seen positions for the edge detector
            for obj in objects.objects.values_mut() {
                if obj.status != ObsvStatus::Leave {
                    obj.update();
                }
            }

            self.rects.rect_mut(i).objects = objects;
        }

        if self.options.reporting {
            self.report();
        }

        for i in (0..self.rects.num_rects()).rev() {
            let objects = &mut self.rects.rect_mut(i).objects;
            objects
                .objects
                .retain(|_, obj| obj.status != ObsvStatus::Leave);
        }

        true
    }

    fn report(&mut self) {
        let messages = if self.has_scheme() {
            scheme::report_schemes(self)
        } else if self.options.is_json {
            self.report_json()
        } else {
            Vec::new()
        };
        let timestamp = self.timestamp;
        self.dispatch(messages, timestamp);
    }

    /// JSON reporting: either one full-frame message per region or one
    /// message per object event, every field gated by the filter mask.
    fn report_json(&mut self) -> Vec<String> {
        let mut messages = Vec::new();

        for i in (0..self.rects.num_rects()).rev() {
            let continuous = self.options.continuous;
            let report_distance = self.options.report_distance;
            let mut moved_ids: Vec<u32> = Vec::new();
            {
                let objects = &self.rects.rect(i).objects;

                let object_json = |obj: &RectObject| -> serde_json::Map<String, serde_json::Value> {
                    let mut map = serde_json::Map::new();
                    if self.filter.enabled(flags::ID) {
                        map.insert(
                            self.filter.alias(filter::keys::ID).to_string(),
                            obj.id.into(),
                        );
                    }
                    if self.filter.enabled(flags::UUID) {
                        map.insert(
                            self.filter.alias(filter::keys::UUID).to_string(),
                            obj.uuid.to_string().into(),
                        );
                    }
                    if self.filter.enabled(flags::TYPE) {
                        let kind = match obj.status {
                            ObsvStatus::Enter => self.filter.alias(filter::keys::ENTER),
                            ObsvStatus::Leave => self.filter.alias(filter::keys::LEAVE),
                            _ => self.filter.alias(filter::keys::MOVE),
                        };
                        map.insert(
                            self.filter.alias(filter::keys::TYPE).to_string(),
                            kind.into(),
                        );
                    }
                    if self.filter.enabled(flags::POS_X) {
                        let x = (obj.x - objects.center_x) * objects.scale_x;
                        map.insert(self.filter.alias(filter::keys::X).to_string(), x.into());
                    }
                    if self.filter.enabled(flags::POS_Y) {
                        let y = (obj.y - objects.center_y) * objects.scale_y;
                        map.insert(self.filter.alias(filter::keys::Y).to_string(), y.into());
                    }
                    if self.filter.enabled(flags::SIZE) {
                        map.insert(
                            self.filter.alias(filter::keys::SIZE).to_string(),
                            obj.size.into(),
                        );
                    }
                    if self.filter.enabled(flags::LIFESPAN) && obj.status == ObsvStatus::Leave {
                        map.insert(
                            self.filter.alias(filter::keys::LIFESPAN).to_string(),
                            obj.lifespan().into(),
                        );
                    }
                    if self.filter.enabled(flags::ENTER_EDGE) && obj.status == ObsvStatus::Enter {
                        map.insert(
                            self.filter.alias(filter::keys::ENTER_EDGE).to_string(),
                            obj.edge.as_str().into(),
                        );
                    }
                    if self.filter.enabled(flags::LEAVE_EDGE) && obj.status == ObsvStatus::Leave {
                        map.insert(
                            self.filter.alias(filter::keys::LEAVE_EDGE).to_string(),
                            obj.edge.as_str().into(),
                        );
                    }
                    map
                };

                let reportable = |obj: &RectObject| match obj.status {
                    ObsvStatus::Enter => self.filter.enabled(flags::ENTER),
                    ObsvStatus::Leave => self.filter.enabled(flags::LEAVE),
                    ObsvStatus::Move => {
                        self.filter.enabled(flags::MOVE)
                            && (continuous || obj.d >= report_distance)
                    }
                    ObsvStatus::Invalid => false,
                };

                let mut body = serde_json::Map::new();
                if self.filter.enabled(flags::TIMESTAMP) {
                    body.insert(
                        self.filter.alias(filter::keys::TIMESTAMP).to_string(),
                        objects.timestamp.into(),
                    );
                }
                if self.filter.enabled(flags::FRAME_ID) {
                    body.insert(
                        self.filter.alias(filter::keys::FRAME_ID).to_string(),
                        objects.frame_id.into(),
                    );
                }
                if self.filter.enabled(flags::REGION) && !objects.region.is_empty() {
                    body.insert(
                        self.filter.alias(filter::keys::REGION).to_string(),
                        objects.region.clone().into(),
                    );
                }
                if self.filter.enabled(flags::COUNT)
                    && (continuous || objects.valid_count != objects.last_count)
                {
                    body.insert(
                        self.filter.alias(filter::keys::COUNT).to_string(),
                        objects.valid_count.into(),
                    );
                }
                if self.filter.enabled(flags::SWITCH)
                    && (continuous
                        || (objects.valid_count > 0) != (objects.last_count > 0))
                {
                    body.insert(
                        self.filter.alias(filter::keys::SWITCH).to_string(),
                        i64::from(objects.valid_count > 0).into(),
                    );
                }
                if self.filter.enabled(flags::ENTER_COUNT)
                    && objects.enter_count != objects.last_enter_count
                {
                    body.insert(
                        self.filter.alias(filter::keys::ENTER_COUNT).to_string(),
                        objects.enter_count.into(),
                    );
                }
                if self.filter.enabled(flags::LEAVE_COUNT)
                    && objects.leave_count != objects.last_leave_count
                {
                    body.insert(
                        self.filter.alias(filter::keys::LEAVE_COUNT).to_string(),
                        objects.leave_count.into(),
                    );
                }
                if self.filter.enabled(flags::GATE_COUNT)
                    && objects.gate_count != objects.last_gate_count
                {
                    body.insert(
                        self.filter.alias(filter::keys::GATE_COUNT).to_string(),
                        objects.gate_count.into(),
                    );
                }

                if self.options.full_frame {
                    let mut array = Vec::new();
                    for obj in objects.objects.values() {
                        if reportable(obj) {
                            array.push(serde_json::Value::Object(object_json(obj)));
                            if obj.status == ObsvStatus::Move {
                                moved_ids.push(obj.id);
                            }
                        }
                    }
                    let has_objects = !array.is_empty();
                    if self.filter.enabled(flags::OBJECTS) && has_objects {
                        body.insert(
                            self.filter.alias(filter::keys::OBJECTS).to_string(),
                            array.into(),
                        );
                    }
                    if !body.is_empty() && (has_objects || !continuous || body.len() > 1) {
                        messages
                            .push(serde_json::Value::Object(body).to_string());
                    }
                } else {
                    for obj in objects.objects.values() {
                        if !reportable(obj) {
                            continue;
                        }
                        let mut event = body.clone();
                        event.insert(
                            self.filter.alias(filter::keys::OBJECT).to_string(),
                            serde_json::Value::Object(object_json(obj)),
                        );
                        messages.push(serde_json::Value::Object(event).to_string());
                        if obj.status == ObsvStatus::Move {
                            moved_ids.push(obj.id);
                        }
                    }
                }
            }

            let objects = &mut self.rects.rect_mut(i).objects;
            for id in moved_ids {
                if let Some(obj) = objects.objects.get_mut(&id) {
                    obj.move_done();
                }
            }
        }
        messages
    }

    pub fn start(&mut self, timestamp: u64) -> bool {
        if self.is_started {
            return false;
        }
        let timestamp = if timestamp == 0 { getmsec() } else { timestamp };
        self.is_started = true;
        self.start_timestamp = timestamp;
        self.timestamp = timestamp;
        self.rects.start();

        self.start_stop_status = 1;
        self.report_action(timestamp, filter::keys::START, flags::START);
        self.start_stop_status = -1;
        info!("observer {} started", self.name);
        true
    }

    pub fn stop(&mut self, timestamp: u64) -> bool {
        if !self.is_started {
            return false;
        }
        let timestamp = if timestamp == 0 { getmsec() } else { timestamp };

        // flush every object out with a final leave
        let empty = TrackedFrame {
            timestamp,
            frame_id: self.frame_id.wrapping_add(1),
            uuid: TrackUuid::nil(),
            objects: Default::default(),
        };
        self.observe(&empty, true);

        self.start_stop_status = 0;
        self.report_action(timestamp, filter::keys::STOP, flags::STOP);
        self.start_stop_status = -1;

        self.is_started = false;
        self.flush();
        info!("observer {} stopped", self.name);
        true
    }

    fn report_action(&mut self, timestamp: u64, action: &str, flag: u64) {
        let messages = if let Some(scheme_name) = match self.start_stop_status {
            1 => Some("start"),
            0 => Some("stop"),
            _ => None,
        } {
            if self.schemes.contains_key(scheme_name) {
                scheme::report_named_scheme(self, scheme_name)
            } else {
                Vec::new()
            }
        } else {
            Vec::new()
        };

        if !messages.is_empty() {
            self.dispatch(messages, timestamp);
            return;
        }

        if self.options.is_json && (self.filter.enabled(flag) || self.filter.enabled(flags::ACTION))
        {
            let mut body = serde_json::Map::new();
            if self.filter.enabled(flags::TIMESTAMP) {
                body.insert(
                    self.filter.alias(filter::keys::TIMESTAMP).to_string(),
                    timestamp.into(),
                );
            }
            body.insert(
                self.filter.alias(filter::keys::ACTION).to_string(),
                self.filter.alias(action).to_string().into(),
            );
            let msg = serde_json::Value::Object(body).to_string();
            self.dispatch(vec![msg], timestamp);
        }
    }

    pub fn stall(&mut self, _timestamp: u64) -> bool {
        if self.is_stalled {
            return false;
        }
        self.is_stalled = true;
        true
    }

    pub fn resume(&mut self, _timestamp: u64) -> bool {
        if !self.is_stalled {
            return false;
        }
        self.is_stalled = false;
        true
    }

    pub fn reset(&mut self, _timestamp: u64) {
        self.rects.reset();
    }
}

impl Drop for BaseObserver {
    fn drop(&mut self) {
        self.flush();
        self.stop_thread();
    }
}

/// Common observer contract; concrete kinds mostly delegate to their
/// embedded [`BaseObserver`].
pub trait Observer: Send {
    fn base(&self) -> &BaseObserver;
    fn base_mut(&mut self) -> &mut BaseObserver;

    fn name(&self) -> String {
        self.base().name.clone()
    }

    fn observe(&mut self, frame: &TrackedFrame, force: bool) -> bool {
        self.base_mut().observe(frame, force)
    }

    fn start(&mut self, timestamp: u64) -> bool {
        self.base_mut().start(timestamp)
    }

    fn stop(&mut self, timestamp: u64) -> bool {
        self.base_mut().stop(timestamp)
    }

    fn stall(&mut self, timestamp: u64) -> bool {
        self.base_mut().stall(timestamp)
    }

    fn resume(&mut self, timestamp: u64) -> bool {
        self.base_mut().resume(timestamp)
    }

    fn reset(&mut self, timestamp: u64) {
        self.base_mut().reset(timestamp)
    }

    fn flush(&mut self) {
        self.base_mut().flush()
    }
}

/// A plain observer fully described by its options, filter and writer.
pub struct GenericObserver {
    pub base: BaseObserver,
}

impl Observer for GenericObserver {
    fn base(&self) -> &BaseObserver {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseObserver {
        &mut self.base
    }
}

/// Fans every call out to all registered observers; itself follows the
/// observer contract.
#[derive(Default)]
pub struct ObserverBus {
    pub observers: Vec<Box<dyn Observer>>,
}

impl ObserverBus {
    pub fn add(&mut self, observer: Box<dyn Observer>) {
        self.observers.push(observer);
    }

    pub fn remove(&mut self, name: &str) {
        self.observers.retain(|o| o.name() != name);
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Box<dyn Observer>> {
        self.observers.iter_mut().find(|o| o.name() == name)
    }

    pub fn observe(&mut self, frame: &TrackedFrame, force: bool) -> bool {
        let mut any = false;
        for observer in self.observers.iter_mut() {
            any |= observer.observe(frame, force);
        }
        any
    }

    pub fn start(&mut self, timestamp: u64) -> bool {
        let mut any = false;
        for observer in self.observers.iter_mut() {
            any |= observer.start(timestamp);
        }
        any
    }

    pub fn stop(&mut self, timestamp: u64) -> bool {
        let mut any = false;
        for observer in self.observers.iter_mut() {
            any |= observer.stop(timestamp);
        }
        any
    }

    pub fn stall(&mut self, timestamp: u64) -> bool {
        let mut any = false;
        for observer in self.observers.iter_mut() {
            any |= observer.stall(timestamp);
        }
        any
    }

    pub fn resume(&mut self, timestamp: u64) -> bool {
        let mut any = false;
        for observer in self.observers.iter_mut() {
            any |= observer.resume(timestamp);
        }
        any
    }

    pub fn reset(&mut self, timestamp: u64) {
        for observer in self.observers.iter_mut() {
            observer.reset(timestamp);
        }
    }

    pub fn flush(&mut self) {
        for observer in self.observers.iter_mut() {
            observer.flush();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::CaptureWriter;
    use super::*;
    use crate::frame::obj_flags;

    fn frame_with(objects: &[(u32, f32, f32)], timestamp: u64) -> TrackedFrame {
        let mut frame = TrackedFrame {
            timestamp,
            frame_id: timestamp / 100,
            uuid: TrackUuid::new(1, 0),
            objects: Default::default(),
        };
        for (id, x, y) in objects {
            frame.insert(FrameObject {
                id: *id,
                uuid: TrackUuid::new(1, *id),
                timestamp,
                x: *x,
                y: *y,
                size: 0.5,
                flags: obj_flags::TOUCHED,
            });
        }
        frame
    }

    fn json_observer(filter: &str) -> (GenericObserver, std::sync::Arc<std::sync::Mutex<Vec<String>>>) {
        let (writer, messages) = CaptureWriter::new();
        let mut base = BaseObserver::new(
            "test",
            ObserverOptions {
                is_json: true,
                full_frame: false,
                continuous: true,
                ..ObserverOptions::default()
            },
            Box::new(writer),
        );
        base.filter.parse(filter).unwrap();
        (GenericObserver { base }, messages)
    }

    #[test]
    fn filtered_fields_never_appear() {
        let (mut observer, messages) = json_observer("type,id,x,enter,move,leave");
        observer.start(1_000);
        observer.observe(&frame_with(&[(1, 0.5, 0.5)], 1_100), false);
        observer.observe(&frame_with(&[(1, 0.6, 0.5)], 1_200), false);

        let msgs = messages.lock().unwrap();
        assert!(!msgs.is_empty());
        for msg in msgs.iter() {
            assert!(!msg.contains("\"y\""), "y leaked into {msg}");
            assert!(!msg.contains("\"size\""), "size leaked into {msg}");
            assert!(!msg.contains("\"timestamp\""));
        }
    }

    #[test]
    fn enter_move_leave_sequence() {
        let (mut observer, messages) = json_observer("type,id,x,y,enter,move,leave");
        observer.start(1_000);
        observer.observe(&frame_with(&[(1, 0.5, 0.5)], 1_100), false);
        observer.observe(&frame_with(&[(1, 0.7, 0.5)], 1_200), false);
        observer.observe(&frame_with(&[], 1_300), false);

        let msgs = messages.lock().unwrap();
        let all = msgs.join("\n");
        assert!(all.contains("enter"));
        assert!(all.contains("move"));
        assert!(all.contains("leave"));
    }

    #[test]
    fn rect_gating_excludes_outside_objects() {
        let (writer, messages) = CaptureWriter::new();
        let mut base = BaseObserver::new(
            "rect",
            ObserverOptions {
                is_json: true,
                full_frame: false,
                ..ObserverOptions::default()
            },
            Box::new(writer),
        );
        base.rects
            .set("zone", 0.0, 0.0, 1.0, 1.0, Edge::None, Shape::Rect);
        let mut observer = GenericObserver { base };
        observer.start(1_000);
        // one object inside the region, one outside
        observer.observe(&frame_with(&[(1, 0.5, 0.5), (2, 5.0, 5.0)], 1_100), false);

        let msgs = messages.lock().unwrap();
        let all = msgs.join("\n");
        assert!(all.contains("\"id\":1"));
        assert!(!all.contains("\"id\":2"));
    }

    #[test]
    fn counters_track_enter_and_leave() {
        let (writer, _messages) = CaptureWriter::new();
        let mut base = BaseObserver::new("count", ObserverOptions::default(), Box::new(writer));
        base.rects
            .set("zone", 0.0, 0.0, 2.0, 2.0, Edge::None, Shape::Rect);
        let mut observer = GenericObserver { base };
        observer.start(1_000);

        observer.observe(&frame_with(&[(1, 0.5, 0.5)], 1_100), false);
        assert_eq!(observer.base().rects.rect(0).objects.valid_count, 1);

        observer.observe(&frame_with(&[], 1_200), false);
        assert_eq!(observer.base().rects.rect(0).objects.valid_count, 0);
        assert_eq!(observer.base().rects.rect(0).objects.lifespan_count, 1);
    }

    #[test]
    fn normalized_rect_scales_positions() {
        let (writer, messages) = CaptureWriter::new();
        let mut base = BaseObserver::new(
            "norm",
            ObserverOptions {
                is_json: true,
                full_frame: false,
                rect_normalized: true,
                ..ObserverOptions::default()
            },
            Box::new(writer),
        );
        base.filter.parse("type,id,x,y,enter,move,leave").unwrap();
        base.rects
            .set("zone", 0.0, 0.0, 4.0, 4.0, Edge::None, Shape::Rect);
        let mut observer = GenericObserver { base };
        observer.start(1_000);
        observer.observe(&frame_with(&[(1, 2.0, 1.0)], 1_100), false);

        let msgs = messages.lock().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&msgs[0]).unwrap();
        let object = &parsed["object"];
        assert!((object["x"].as_f64().unwrap() - 0.5).abs() < 1e-6);
        assert!((object["y"].as_f64().unwrap() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn ellipse_region_containment() {
        let rect = ObsvRect {
            x: 0.0,
            y: 0.0,
            width: 2.0,
            height: 2.0,
            shape: Shape::Ellipse,
            ..ObsvRect::default()
        };
        assert!(rect.contains(1.0, 1.0, 0.0)); // centre
        assert!(!rect.contains(0.05, 0.05, 0.0)); // corner is outside
    }

    #[test]
    fn latent_objects_skipped_without_use_latent() {
        let (mut observer, messages) = json_observer("type,id,enter,move,leave");
        observer.start(1_000);
        let mut frame = frame_with(&[(1, 0.5, 0.5)], 1_100);
        frame.insert(FrameObject {
            id: 9,
            uuid: TrackUuid::new(1, 9),
            timestamp: 1_100,
            x: 0.5,
            y: 0.5,
            size: 0.5,
            flags: obj_flags::TOUCHED | obj_flags::LATENT,
        });
        observer.observe(&frame, false);

        let msgs = messages.lock().unwrap();
        let all = msgs.join("\n");
        assert!(all.contains("\"id\":1"));
        assert!(!all.contains("\"id\":9"));
    }
}
