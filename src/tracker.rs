use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::frame::{obj_flags, FrameObject, TrackedFrame};
use crate::geometry::{Point2, Vector2};
use crate::track_uuid::TrackUuid;
use crate::util::getmsec;

/// Objects faster than this are clamped after the motion update.
const MAX_SPEED: f32 = 1.0;
/// Motion is only integrated for inter-frame gaps above this.
const MIN_MOTION_TIME: f32 = 1.0 / 80.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackParams {
    /// Max distance between objects to be united into a single layer
    pub unite_distance: f32,
    /// Max distance to identify two objects across consecutive frames
    pub track_distance: f32,
    /// On drop, search for a younger object within this factor of trackDistance
    pub track_oldest_factor: f32,
    /// On drop, park the id on the closest neighbour within this distance
    pub latent_distance: f32,
    /// Keep latent ids for this many milliseconds
    pub latent_life_time: u64,
    /// Max object size before splitting
    pub object_max_size: f32,
    /// Weight of motion prediction in consecutive frames
    pub track_motion_predict: f32,
    /// Milliseconds to keep an undetected object before dropping it
    pub keep_time: u64,
    /// Min milliseconds an object must exist before it is reported
    pub min_active_time: u64,
    /// Fraction of minActiveTime the object must be continuously detected
    pub min_active_fraction: f32,
    /// Filter weight between old and new values; 0 = copy, 1 = no change
    pub track_filter_weight: f32,
    /// Output smoothing; 0 = copy, 1 = no change
    pub track_smoothing: f32,
    #[serde(rename = "distance2D")]
    pub distance_2d: bool,
    /// Milliseconds inside a private region until flagged private
    pub private_timeout: u64,
    /// Milliseconds without movement until flagged immobile
    pub immobile_timeout: u64,
    /// Metres of movement that reset the immobile anchor
    pub immobile_distance: f32,
    /// Fuse all substage blobs pairwise instead of stage by stage
    pub unite_in_single_stage: bool,
}

impl Default for TrackParams {
    fn default() -> Self {
        TrackParams {
            unite_distance: 0.75,
            track_distance: 1.2,
            track_oldest_factor: 0.0,
            latent_distance: 0.0,
            latent_life_time: 10_000,
            object_max_size: 0.0,
            track_motion_predict: 0.0,
            keep_time: 1_000,
            min_active_time: 500,
            min_active_fraction: 0.25,
            track_filter_weight: 0.5,
            track_smoothing: 0.6,
            distance_2d: true,
            private_timeout: 5_000,
            immobile_timeout: 60 * 60 * 1000,
            immobile_distance: 1.0,
            unite_in_single_stage: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LatentId {
    pub uuid: TrackUuid,
    pub timestamp: u64,
}

/// String ids parked on a nearby object for later inheritance.
#[derive(Debug, Clone, Default)]
pub struct LatentIds(IndexMap<String, LatentId>);

impl LatentIds {
    pub fn put(&mut self, id: &str, uuid: TrackUuid, timestamp: u64) {
        if self.0.contains_key(id) {
            return;
        }
        self.0.insert(id.to_string(), LatentId { uuid, timestamp });
    }

    pub fn remove(&mut self, id: &str) {
        self.0.shift_remove(id);
    }

    pub fn oldest(&self) -> Option<(&str, u64)> {
        self.0
            .iter()
            .filter(|(_, latent)| latent.timestamp > 0)
            .min_by_key(|(_, latent)| latent.timestamp)
            .map(|(id, latent)| (id.as_str(), latent.timestamp))
    }

    pub fn get(&self, id: &str) -> Option<&LatentId> {
        self.0.get(id)
    }

    pub fn add_time(&mut self, time: u64) {
        for latent in self.0.values_mut() {
            latent.timestamp += time;
        }
    }

    pub fn cleanup(&mut self, older_than_msec: u64, timestamp: u64) {
        self.0
            .retain(|_, latent| latent.timestamp + older_than_msec >= timestamp);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, String, LatentId> {
        self.0.iter()
    }
}

/// One blob as delivered by a device stage, already in world coordinates.
#[derive(Debug, Clone, Copy)]
pub struct StageObject {
    pub pos: Point2,
    pub size: f32,
    pub split_prob: f32,
}

#[derive(Debug, Default)]
pub struct SubStage {
    pub id: String,
    pub latest: Vec<StageObject>,
    pub last_time: u64,
    pub frame_count: u64,
}

#[derive(Debug, Clone)]
pub struct TrackedObject {
    /// Smoothed output position and size
    pub out_pos: Point2,
    pub out_size: f32,
    /// Filtered position and size
    pub pos: Point2,
    pub size: f32,
    pub motion: Vector2,
    pub predicted: Point2,
    pub num_weight: i32,
    pub first_time: u64,
    pub last_time: u64,
    pub first_private_time: u64,
    pub first_immobile_time: u64,
    pub immobile_pos: Point2,
    pub flags: u16,
    pub activated: bool,
    pub erasable: bool,
    pub split_prob: f32,
    pub id: String,
    pub uuid: TrackUuid,
    pub latent_ids: LatentIds,
}

impl TrackedObject {
    fn from_stage_object(obj: &StageObject, timestamp: u64) -> Self {
        TrackedObject {
            out_pos: obj.pos,
            out_size: obj.size,
            pos: obj.pos,
            size: obj.size,
            motion: Vector2::zeros(),
            predicted: obj.pos,
            num_weight: 1,
            first_time: timestamp,
            last_time: timestamp,
            first_private_time: 0,
            first_immobile_time: 0,
            immobile_pos: obj.pos,
            flags: 0,
            activated: false,
            erasable: false,
            split_prob: obj.split_prob,
            id: String::new(),
            uuid: TrackUuid::nil(),
            latent_ids: LatentIds::default(),
        }
    }

    pub fn distance_to(&self, other: &TrackedObject) -> f32 {
        (self.pos - other.pos).norm()
    }

    /// Blend `other` in with `weight` kept for self.
    fn mix_with(&mut self, other_pos: Point2, other_size: f32, weight: f32) {
        let one_minus = 1.0 - weight;
        self.pos = Point2::new(
            weight * self.pos.x + one_minus * other_pos.x,
            weight * self.pos.y + one_minus * other_pos.y,
        );
        self.size = weight * self.size + one_minus * other_size;
    }

    pub fn is_touched(&self) -> bool {
        self.flags & obj_flags::TOUCHED != 0
    }

    fn set_flag(&mut self, flag: u16, set: bool) {
        if set {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    /// Private only after the mask has held for the timeout.
    fn touch_private(&mut self, set: bool, timestamp: u64, timeout: u64) {
        if set {
            if self.first_private_time == 0 {
                self.first_private_time = timestamp;
            } else if timestamp - self.first_private_time > timeout {
                self.set_flag(obj_flags::PRIVATE, true);
            }
        } else {
            self.first_private_time = 0;
        }
    }

    fn check_immobile(&mut self, timestamp: u64, timeout: u64, max_dist: f32) {
        let distance = (self.immobile_pos - self.pos).norm();
        if distance > max_dist {
            self.immobile_pos = self.pos;
            self.first_immobile_time = timestamp;
            self.set_flag(obj_flags::IMMOBILE, false);
        } else if self.first_immobile_time == 0 {
            self.first_immobile_time = timestamp;
        } else if self.flags & obj_flags::IMMOBILE == 0
            && timestamp - self.first_immobile_time > timeout
        {
            self.set_flag(obj_flags::IMMOBILE, true);
        }
    }

    fn limit_speed(&mut self, max_speed: f32) {
        let speed = self.motion.norm();
        if speed > max_speed {
            self.motion *= max_speed / speed;
        }
    }
}

/// Swap the stable identity (id, uuid, private/immobile state) between two
/// tracked objects.
fn swap_identity(current: &mut [TrackedObject], a: usize, b: usize) {
    if a == b {
        return;
    }
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    let (left, right) = current.split_at_mut(hi);
    let x = &mut left[lo];
    let y = &mut right[0];
    std::mem::swap(&mut x.id, &mut y.id);
    std::mem::swap(&mut x.uuid, &mut y.uuid);

    let keep = obj_flags::PRIVATE | obj_flags::IMMOBILE;
    let xf = x.flags & keep;
    let yf = y.flags & keep;
    x.flags = (x.flags & !keep) | yf;
    y.flags = (y.flags & !keep) | xf;
}

#[derive(Debug, Clone, Copy)]
struct TrackPair {
    distance: f32,
    current_index: usize,
    merged_index: usize,
}

fn sort_pairs(pairs: &mut [TrackPair]) {
    pairs.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

pub type TrackableMask = Box<dyn Fn(&TrackedObject) -> u16 + Send>;

/// Unites the blob populations of all device stages into one tracked set
/// with stable string ids, motion prediction, latent-id recovery and
/// private/portal/immobile classification.
pub struct MultiStageTracker {
    pub params: TrackParams,
    pub sub_stages: Vec<SubStage>,
    current: Vec<TrackedObject>,
    pub timestamp: u64,
    pub start_time: u64,
    pub frame_count: u64,
    pub uuid: TrackUuid,
    next_id: u32,
    started: bool,
    /// External classifier returning Private/Portal/Occluded bits.
    pub trackable_mask: Option<TrackableMask>,
}

impl MultiStageTracker {
    pub fn new(params: TrackParams) -> Self {
        MultiStageTracker {
            params,
            sub_stages: Vec::new(),
            current: Vec::new(),
            timestamp: 0,
            start_time: 0,
            frame_count: 0,
            uuid: TrackUuid::nil(),
            next_id: 0,
            started: false,
            trackable_mask: None,
        }
    }

    pub fn start(&mut self, timestamp: u64) {
        if self.started {
            return;
        }
        self.started = true;
        self.start_time = if timestamp == 0 { getmsec() } else { timestamp };
        self.uuid = TrackUuid::new(self.start_time, 0);
        self.next_id = 0;
    }

    pub fn stop(&mut self) {
        self.started = false;
        self.current.clear();
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn reset(&mut self) {
        for stage in self.sub_stages.iter_mut() {
            stage.latest.clear();
        }
        self.current.clear();
    }

    pub fn current_len(&self) -> usize {
        self.current.len()
    }

    /// Replace one substage's population for this frame, creating the stage
    /// on first sight.
    pub fn set_stage_objects(&mut self, stage_id: &str, objects: Vec<StageObject>, timestamp: u64) {
        let stage = match self.sub_stages.iter_mut().find(|s| s.id == stage_id) {
            Some(stage) => stage,
            None => {
                self.sub_stages.push(SubStage {
                    id: stage_id.to_string(),
                    ..SubStage::default()
                });
                self.sub_stages.last_mut().unwrap()
            }
        };
        stage.latest = objects;
        stage.last_time = timestamp;
        stage.frame_count = stage.frame_count.wrapping_add(1);
    }

    pub fn remove_stage(&mut self, stage_id: &str) {
        self.sub_stages.retain(|s| s.id != stage_id);
    }

    fn next_id(&mut self) -> String {
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
        self.next_id.to_string()
    }

    /// Stage mode: fold each substage into `merged`, nearest-first within
    /// uniteDistance, averaging with 1/numWeight.
    fn merge_stage(&self, merged: &mut Vec<TrackedObject>, stage: &[StageObject], timestamp: u64) {
        let mut pairs: Vec<TrackPair> = Vec::new();
        for (i, obj) in stage.iter().enumerate() {
            for (j, m) in merged.iter().enumerate() {
                let d = (obj.pos - m.pos).norm();
                if d <= self.params.unite_distance {
                    pairs.push(TrackPair {
                        distance: d,
                        current_index: i,
                        merged_index: j,
                    });
                }
            }
        }
        sort_pairs(&mut pairs);

        let mut stage_used = vec![false; stage.len()];
        let mut merged_used = vec![false; merged.len()];
        for pair in pairs.iter() {
            if !stage_used[pair.current_index] && !merged_used[pair.merged_index] {
                let m = &mut merged[pair.merged_index];
                m.num_weight += 1;
                let obj = &stage[pair.current_index];
                m.mix_with(obj.pos, obj.size, 1.0 / m.num_weight as f32);
                stage_used[pair.current_index] = true;
                merged_used[pair.merged_index] = true;
            }
        }

        for (i, obj) in stage.iter().enumerate() {
            if !stage_used[i] {
                merged.push(TrackedObject::from_stage_object(obj, timestamp));
            }
        }
    }

    /// Single-stage mode: concatenate everything, then repeatedly fuse the
    /// closest pair following merge chains until no pair is within
    /// uniteDistance.
    fn merge_single_stage(&self, merged: &mut Vec<TrackedObject>, timestamp: u64) {
        for stage in self.sub_stages.iter().rev() {
            for obj in stage.latest.iter().rev() {
                merged.push(TrackedObject::from_stage_object(obj, timestamp));
            }
        }

        let mut pairs: Vec<TrackPair> = Vec::new();
        for i in (1..merged.len()).rev() {
            for j in (0..i).rev() {
                let d = merged[i].distance_to(&merged[j]);
                if d <= self.params.unite_distance {
                    pairs.push(TrackPair {
                        distance: d,
                        current_index: i,
                        merged_index: j,
                    });
                }
            }
        }
        sort_pairs(&mut pairs);

        let mut mixed_index: Vec<i64> = vec![-1; merged.len()];
        for pair in pairs.iter() {
            if mixed_index[pair.current_index] >= 0 && mixed_index[pair.merged_index] >= 0 {
                continue;
            }
            let mut merged_index = pair.merged_index;
            let mut current_index = pair.current_index;
            if mixed_index[merged_index] < 0 {
                std::mem::swap(&mut merged_index, &mut current_index);
            }
            while mixed_index[merged_index] >= 0 {
                merged_index = mixed_index[merged_index] as usize;
            }
            if merged_index == current_index {
                continue;
            }
            let (cur_pos, cur_size, cur_weight) = {
                let c = &merged[current_index];
                (c.pos, c.size, c.num_weight)
            };
            let m = &mut merged[merged_index];
            m.num_weight += 1;
            m.mix_with(cur_pos, cur_size, cur_weight as f32 / m.num_weight as f32);
            mixed_index[current_index] = merged_index as i64;
        }

        for i in (0..merged.len()).rev() {
            if mixed_index[i] >= 0 {
                merged.remove(i);
            }
        }
    }

    fn motion_time(&self, dt: u64) -> f32 {
        if dt < 4000 / 30 {
            dt as f32 / 1000.0
        } else {
            0.0
        }
    }

    fn predict_weight(&self, dt: u64) -> f32 {
        self.params.track_motion_predict * self.motion_time(dt)
    }

    fn mask_bits(&self, obj: &TrackedObject) -> u16 {
        self.trackable_mask.as_ref().map(|f| f(obj)).unwrap_or(0)
    }

    fn is_in_portal(&self, obj: &TrackedObject) -> bool {
        self.mask_bits(obj) & obj_flags::PORTAL != 0
    }

    /// Whether `other` lies within `distance` of `obj` extended by the
    /// motion cone of both; narrows `distance` on success.
    fn is_closer(
        obj: &TrackedObject,
        other: &TrackedObject,
        current_speed: f32,
        time: f32,
        distance: &mut f32,
    ) -> bool {
        let speed_sum = current_speed + other.motion.norm();
        let speed_dist = 5.0 * time * speed_sum;
        let d = other.distance_to(obj);
        if d < *distance + speed_dist {
            *distance = d;
            return true;
        }
        false
    }

    /// Park the dropped object's id on the nearest activated neighbour.
    fn put_latent_id(&mut self, current_index: usize, max_distance: f32, time: f32, timestamp: u64) {
        if max_distance <= 0.0 {
            return;
        }
        let current_speed = self.current[current_index].motion.norm();
        let mut distance = max_distance;
        let mut latent_host = None;

        for i in (0..self.current.len()).rev() {
            if i != current_index && self.current[i].activated {
                let (obj, other) = (&self.current[current_index], &self.current[i]);
                if Self::is_closer(obj, other, current_speed, time, &mut distance) {
                    latent_host = Some(i);
                }
            }
        }

        if let Some(host) = latent_host {
            let (id, uuid) = {
                let obj = &self.current[current_index];
                (obj.id.clone(), obj.uuid)
            };
            if !id.is_empty() {
                self.current[host].latent_ids.put(&id, uuid, timestamp);
            }
        }
    }

    /// Look for the oldest latent id on any nearby activated neighbour and
    /// take it off the owner.
    fn get_latent_id(
        &mut self,
        current_index: usize,
        max_distance: f32,
        time: f32,
    ) -> Option<String> {
        if max_distance <= 0.0 {
            return None;
        }
        let current_speed = self.current[current_index].motion.norm();
        let mut distance = max_distance;
        let mut found: Option<(usize, String)> = None;

        for i in (0..self.current.len()).rev() {
            if i == current_index || !self.current[i].activated {
                continue;
            }
            let candidate = self.current[i].latent_ids.oldest().map(|(id, _)| id.to_string());
            if let Some(id) = candidate {
                let (obj, other) = (&self.current[current_index], &self.current[i]);
                if Self::is_closer(obj, other, current_speed, time, &mut distance) {
                    found = Some((i, id));
                }
            }
        }

        found.map(|(owner, id)| {
            self.current[owner].latent_ids.remove(&id);
            id
        })
    }

    /// When a dropped activated object has a younger activated neighbour in
    /// range, hand the older identity over instead of losing it.
    fn swap_to_oldest(
        &mut self,
        current_index: usize,
        max_distance: f32,
        time: f32,
        matched: &[i64],
    ) -> bool {
        if max_distance <= 0.0 || !self.current[current_index].activated {
            return false;
        }
        let current_speed = self.current[current_index].motion.norm();
        let mut distance = max_distance;
        let mut swap_index = None;

        for j in (0..self.current.len()).rev() {
            if matched[j] >= 0
                && self.current[j].activated
                && self.current[current_index].first_time < self.current[j].first_time
            {
                let (obj, other) = (&self.current[current_index], &self.current[j]);
                if Self::is_closer(obj, other, current_speed, time, &mut distance) {
                    swap_index = Some(j);
                }
            }
        }

        if let Some(j) = swap_index {
            swap_identity(&mut self.current, j, current_index);
            return true;
        }
        false
    }

    /// One tracker step: unite all substages into the carried population and
    /// publish the activated objects.
    pub fn unite(&mut self, timestamp: u64) -> TrackedFrame {
        let timestamp = if timestamp == 0 { getmsec() } else { timestamp };
        let params = self.params;

        let mut merged: Vec<TrackedObject> = Vec::new();
        if self.started {
            if params.unite_in_single_stage {
                self.merge_single_stage(&mut merged, timestamp);
            } else {
                let stages: Vec<Vec<StageObject>> = self
                    .sub_stages
                    .iter()
                    .rev()
                    .map(|s| s.latest.clone())
                    .collect();
                for stage in stages.iter() {
                    self.merge_stage(&mut merged, stage, timestamp);
                }
            }
        }

        let now = timestamp;
        let time_diff = now.saturating_sub(self.timestamp);
        self.timestamp = now;

        let last_pos: Vec<Point2> = self.current.iter().map(|c| c.pos).collect();
        let predict_weight = self.predict_weight(time_diff);
        let time = self.motion_time(time_diff);

        for obj in self.current.iter_mut() {
            obj.predicted = obj.pos + predict_weight * obj.motion;
        }

        // distances between predicted current positions and merged entries
        let mut pairs: Vec<TrackPair> = Vec::new();
        for (i, cur) in self.current.iter().enumerate() {
            for (j, m) in merged.iter().enumerate() {
                let d = (m.pos - cur.predicted).norm();
                if d <= params.track_distance {
                    pairs.push(TrackPair {
                        distance: d,
                        current_index: i,
                        merged_index: j,
                    });
                }
            }
        }
        sort_pairs(&mut pairs);

        let mut current_map: Vec<i64> = vec![-1; self.current.len()];
        let mut merged_map: Vec<i64> = vec![-1; merged.len()];

        for pair in pairs.iter() {
            if current_map[pair.current_index] < 0 && merged_map[pair.merged_index] < 0 {
                current_map[pair.current_index] = pair.merged_index as i64;
                merged_map[pair.merged_index] = pair.current_index as i64;
            }
        }

        // an older activated object steals the binding of a not-yet
        // activated one
        for pair in pairs.iter() {
            if current_map[pair.current_index] >= 0 || merged_map[pair.merged_index] < 0 {
                continue;
            }
            let bound_current = merged_map[pair.merged_index] as usize;
            if self.current[bound_current].activated {
                continue;
            }
            let challenger = &self.current[pair.current_index];
            if challenger.activated
                && challenger.first_time < self.current[bound_current].first_time
            {
                current_map[pair.current_index] = pair.merged_index as i64;
                current_map[bound_current] = -1;
                merged_map[pair.merged_index] = pair.current_index as i64;
            }
        }

        // fold matched merged entries into their current objects
        for i in 0..self.current.len() {
            if current_map[i] >= 0 {
                let m = &merged[current_map[i] as usize];
                let (m_pos, m_size, m_split) = (m.pos, m.size, m.split_prob);
                let cur = &mut self.current[i];
                cur.mix_with(m_pos, m_size, params.track_filter_weight);
                cur.last_time = now;
                cur.split_prob = m_split;
            }
        }

        // motion update
        for i in 0..self.current.len() {
            let cur = &mut self.current[i];
            if time > MIN_MOTION_TIME {
                if current_map[i] >= 0 {
                    let alpha = 0.25 * (1.0 - params.track_filter_weight);
                    let motion = (cur.pos - last_pos[i]) / time;
                    cur.motion = alpha * motion + (1.0 - alpha) * cur.motion;
                    cur.limit_speed(MAX_SPEED);
                } else if predict_weight > 0.0 {
                    // coast, slowing down over the keep time
                    let mut alpha = 0.0;
                    if params.keep_time > 0 {
                        alpha = (1.0
                            - (now.saturating_sub(cur.last_time)) as f32
                                / params.keep_time as f32)
                            * predict_weight;
                    }
                    cur.pos += alpha * cur.motion;
                }
            } else {
                cur.motion = Vector2::zeros();
            }
        }

        // drop old unmatched objects, parking their id as latent
        for i in (0..self.current.len()).rev() {
            let touched = current_map[i] >= 0;
            self.current[i].set_flag(obj_flags::TOUCHED, touched);
            if touched {
                continue;
            }
            let tdiff = now.saturating_sub(self.current[i].last_time);
            if tdiff >= params.keep_time {
                let in_portal = self.is_in_portal(&self.current[i]);
                if !in_portal {
                    if params.track_oldest_factor > 0.0 {
                        self.swap_to_oldest(
                            i,
                            params.track_oldest_factor * params.track_distance,
                            time,
                            &current_map,
                        );
                    }
                    self.put_latent_id(i, params.latent_distance, time, now);
                }
                self.current[i].erasable = true;
            }
        }

        // adopt unmatched merged entries as new candidates
        for (j, m) in merged.into_iter().enumerate() {
            if merged_map[j] >= 0 || m.erasable {
                continue;
            }
            let mut obj = m;
            obj.first_time = now;
            obj.last_time = now;
            obj.set_flag(obj_flags::TOUCHED, true);

            // delay activation while something activated is close by
            for pair in pairs.iter() {
                if pair.distance >= params.unite_distance {
                    break;
                }
                if pair.merged_index == j && self.current[pair.current_index].activated {
                    obj.first_time = now;
                    break;
                }
            }
            self.current.push(obj);
        }

        self.current.retain(|c| !c.erasable);

        // output smoothing, gated by a speed plausibility check
        let sms = params.track_smoothing;
        let oms = 1.0 - sms;
        let sms_size = 1.0 - (1.0 - sms) * 0.6;
        let oms_size = 1.0 - sms_size;

        for cur in self.current.iter_mut() {
            let step = (cur.out_pos - cur.pos).norm();
            if is_valid_speed(time_diff as i64, step) {
                cur.out_pos = Point2::new(
                    sms * cur.out_pos.x + oms * cur.pos.x,
                    sms * cur.out_pos.y + oms * cur.pos.y,
                );
                cur.out_size = sms_size * cur.out_size + oms_size * cur.size;
            } else {
                cur.out_pos = cur.pos;
                cur.out_size = cur.size;
            }
        }

        // activation, latent inheritance and classification
        let mut i = 0;
        while i < self.current.len() {
            if !self.current[i].activated {
                let cur = &self.current[i];
                if now.saturating_sub(cur.last_time)
                    > (params.min_active_time as f32 * params.min_active_fraction) as u64
                {
                    self.current.remove(i);
                    continue;
                }
                if self.current[i].is_touched()
                    && now.saturating_sub(self.current[i].first_time) > params.min_active_time
                {
                    let latent_id = if !self.is_in_portal(&self.current[i]) {
                        self.get_latent_id(i, params.latent_distance, time)
                    } else {
                        None
                    };
                    let start_time = self.start_time;
                    let id = match latent_id {
                        Some(id) => id,
                        None => self.next_id(),
                    };
                    let cur = &mut self.current[i];
                    cur.uuid =
                        TrackUuid::new(start_time, id.parse::<u32>().unwrap_or_default());
                    cur.id = id;
                    cur.activated = true;
                    cur.immobile_pos = cur.pos;
                }
            }

            if self.current[i].activated {
                let mask_bits = self.mask_bits(&self.current[i]);
                if mask_bits & obj_flags::OCCLUDED == 0 {
                    let cur = &mut self.current[i];
                    cur.touch_private(
                        mask_bits & obj_flags::PRIVATE != 0,
                        now,
                        params.private_timeout,
                    );
                    cur.set_flag(obj_flags::PORTAL, mask_bits & obj_flags::PORTAL != 0);
                    cur.check_immobile(now, params.immobile_timeout, params.immobile_distance);
                }
            }
            i += 1;
        }

        self.frame_count = self.frame_count.wrapping_add(1);

        // age out latent ids; split hosts push their parked timestamps
        // forward so an id split between two people survives longer
        for cur in self.current.iter_mut() {
            if cur.split_prob > 0.85 {
                cur.latent_ids.add_time(time_diff);
            }
            cur.latent_ids.cleanup(params.latent_life_time, now);
        }

        self.emit(now)
    }

    /// Snapshot of activated, non-occluded objects plus latent shadow
    /// entries.
    fn emit(&self, timestamp: u64) -> TrackedFrame {
        let mut frame = TrackedFrame {
            timestamp,
            frame_id: self.frame_count,
            uuid: self.uuid,
            objects: Default::default(),
        };

        for cur in self.current.iter() {
            if !cur.activated {
                continue;
            }
            if self.mask_bits(cur) & obj_flags::OCCLUDED != 0 {
                continue;
            }
            let object = FrameObject {
                id: cur.id.parse().unwrap_or_default(),
                uuid: cur.uuid,
                timestamp,
                x: cur.out_pos.x,
                y: cur.out_pos.y,
                size: cur.out_size,
                flags: cur.flags,
            };
            frame.insert(object);

            for (id, latent) in cur.latent_ids.iter() {
                let mut shadow = object;
                shadow.id = id.parse().unwrap_or_default();
                shadow.uuid = latent.uuid;
                shadow.flags |= obj_flags::LATENT;
                frame.insert(shadow);
            }
        }
        frame
    }
}

fn is_valid_duration(duration: i64) -> bool {
    duration > 0 && duration < 5000
}

fn is_valid_speed(duration: i64, distance: f32) -> bool {
    is_valid_duration(duration) && distance / (duration as f32 / 1000.0) < 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(x: f32, y: f32) -> StageObject {
        StageObject {
            pos: Point2::new(x, y),
            size: 0.3,
            split_prob: 0.0,
        }
    }

    fn params() -> TrackParams {
        TrackParams {
            min_active_time: 500,
            min_active_fraction: 0.25,
            keep_time: 1_000,
            track_smoothing: 0.6,
            ..TrackParams::default()
        }
    }

    fn run_frames(
        tracker: &mut MultiStageTracker,
        positions: &[(f32, f32)],
        start: u64,
        step: u64,
    ) -> TrackedFrame {
        let mut frame = TrackedFrame::default();
        for (i, (x, y)) in positions.iter().enumerate() {
            let ts = start + i as u64 * step;
            tracker.set_stage_objects("dev0", vec![obj(*x, *y)], ts);
            frame = tracker.unite(ts);
        }
        frame
    }

    #[test]
    fn activation_needs_min_active_time() {
        let mut tracker = MultiStageTracker::new(params());
        tracker.start(1_000);

        tracker.set_stage_objects("dev0", vec![obj(0.0, 1.0)], 1_000);
        let frame = tracker.unite(1_000);
        assert!(frame.is_empty());

        // after 600 ms of continuous detection the object activates
        let frame = run_frames(
            &mut tracker,
            &[(0.0, 1.0); 6],
            1_100,
            100,
        );
        assert_eq!(frame.len(), 1);
        let object = frame.objects.values().next().unwrap();
        assert_eq!(object.id, 1);
        assert!(object.is_touched());
    }

    #[test]
    fn motion_and_smoothing() {
        let mut tracker = MultiStageTracker::new(TrackParams {
            track_smoothing: 0.6,
            min_active_time: 500,
            min_active_fraction: 0.25,
            ..TrackParams::default()
        });
        tracker.start(0);

        // a blob moving +0.1 m per 100 ms frame: 1 m/s
        let positions: Vec<(f32, f32)> = (0..11).map(|i| (i as f32 * 0.1, 1.0)).collect();
        let frame = run_frames(&mut tracker, &positions, 1_000, 100);
        assert_eq!(frame.len(), 1);

        let cur = &tracker.current[0];
        assert!(cur.motion.x > 0.5, "motion.x = {}", cur.motion.x);
        assert!(cur.motion.norm() <= MAX_SPEED + 1e-3);
        // smoothed output lags the raw position
        let object = frame.objects.values().next().unwrap();
        assert!(object.x < cur.pos.x);
        assert!(object.x > 0.0);
    }

    #[test]
    fn speed_limit_holds() {
        let mut tracker = MultiStageTracker::new(params());
        tracker.start(0);
        // jumps of 1 m per 100 ms frame would be 10 m/s
        let positions: Vec<(f32, f32)> = (0..8).map(|i| (i as f32, 1.0)).collect();
        run_frames(&mut tracker, &positions, 1_000, 100);
        for cur in tracker.current.iter() {
            assert!(cur.motion.norm() <= MAX_SPEED + 1e-3);
        }
    }

    #[test]
    fn keep_time_zero_drops_immediately() {
        let mut tracker = MultiStageTracker::new(TrackParams {
            keep_time: 0,
            min_active_time: 200,
            ..params()
        });
        tracker.start(0);
        run_frames(&mut tracker, &[(0.0, 1.0); 5], 1_000, 100);
        assert_eq!(tracker.current_len(), 1);

        // object disappears; with keepTime 0 it is dropped on the next frame
        tracker.set_stage_objects("dev0", vec![], 1_600);
        tracker.unite(1_600);
        assert_eq!(tracker.current_len(), 0);
    }

    #[test]
    fn latent_id_recovery() {
        let mut tracker = MultiStageTracker::new(TrackParams {
            latent_distance: 0.5,
            keep_time: 200,
            min_active_time: 300,
            min_active_fraction: 0.25,
            latent_life_time: 10_000,
            ..TrackParams::default()
        });
        tracker.start(0);

        // two objects approach within latent distance
        let mut ts = 1_000;
        for _ in 0..8 {
            tracker.set_stage_objects(
                "dev0",
                vec![obj(0.0, 1.0), obj(0.35, 1.0)],
                ts,
            );
            tracker.unite(ts);
            ts += 100;
        }
        assert_eq!(tracker.current_len(), 2);
        let ids: Vec<String> = tracker.current.iter().map(|c| c.id.clone()).collect();
        assert!(ids.contains(&"1".to_string()) && ids.contains(&"2".to_string()));
        let gone_id = tracker
            .current
            .iter()
            .find(|c| (c.pos.x - 0.35).abs() < 0.1)
            .unwrap()
            .id
            .clone();

        // one disappears for 800 ms
        for _ in 0..8 {
            tracker.set_stage_objects("dev0", vec![obj(0.0, 1.0)], ts);
            tracker.unite(ts);
            ts += 100;
        }
        assert_eq!(tracker.current_len(), 1);
        assert!(!tracker.current[0].latent_ids.is_empty());

        // it reappears at the partner's location and inherits the parked id
        for _ in 0..5 {
            tracker.set_stage_objects(
                "dev0",
                vec![obj(0.0, 1.0), obj(0.1, 1.0)],
                ts,
            );
            tracker.unite(ts);
            ts += 100;
        }
        let revived = tracker
            .current
            .iter()
            .find(|c| (c.pos.x - 0.1).abs() < 0.09)
            .unwrap();
        assert_eq!(revived.id, gone_id);
        assert!(tracker.current.iter().all(|c| c.latent_ids.is_empty()));
    }

    #[test]
    fn latent_ids_expire() {
        let mut tracker = MultiStageTracker::new(TrackParams {
            latent_distance: 0.5,
            keep_time: 200,
            min_active_time: 300,
            latent_life_time: 10_000,
            ..TrackParams::default()
        });
        tracker.start(0);

        let mut ts = 1_000;
        for _ in 0..8 {
            tracker.set_stage_objects("dev0", vec![obj(0.0, 1.0), obj(0.35, 1.0)], ts);
            tracker.unite(ts);
            ts += 100;
        }
        for _ in 0..8 {
            tracker.set_stage_objects("dev0", vec![obj(0.0, 1.0)], ts);
            tracker.unite(ts);
            ts += 100;
        }
        assert!(!tracker.current[0].latent_ids.is_empty());

        // after latentLifeTime the parked id is gone
        ts += 11_000;
        tracker.set_stage_objects("dev0", vec![obj(0.0, 1.0)], ts);
        tracker.unite(ts);
        assert!(tracker.current[0].latent_ids.is_empty());
    }

    #[test]
    fn two_stages_unite_within_distance() {
        let mut tracker = MultiStageTracker::new(TrackParams {
            unite_distance: 0.75,
            min_active_time: 200,
            ..TrackParams::default()
        });
        tracker.start(0);

        let mut frame = TrackedFrame::default();
        for i in 0..6u64 {
            let ts = 1_000 + i * 100;
            tracker.set_stage_objects("dev0", vec![obj(0.0, 1.0)], ts);
            tracker.set_stage_objects("dev1", vec![obj(0.1, 1.0)], ts);
            frame = tracker.unite(ts);
        }
        // the two device views fuse into one tracked object
        assert_eq!(frame.len(), 1);
    }

    #[test]
    fn unite_distance_zero_keeps_objects_apart() {
        let mut tracker = MultiStageTracker::new(TrackParams {
            unite_distance: 0.0,
            min_active_time: 200,
            ..TrackParams::default()
        });
        tracker.start(0);

        let mut frame = TrackedFrame::default();
        for i in 0..6u64 {
            let ts = 1_000 + i * 100;
            tracker.set_stage_objects("dev0", vec![obj(0.0, 1.0)], ts);
            tracker.set_stage_objects("dev1", vec![obj(0.1, 1.0)], ts);
            frame = tracker.unite(ts);
        }
        assert_eq!(frame.len(), 2);
    }

    #[test]
    fn occluded_objects_are_not_reported() {
        let mut tracker = MultiStageTracker::new(params());
        tracker.trackable_mask = Some(Box::new(|obj| {
            if obj.pos.x > 0.5 {
                obj_flags::OCCLUDED
            } else {
                0
            }
        }));
        tracker.start(0);

        let mut frame = TrackedFrame::default();
        for i in 0..8u64 {
            let ts = 1_000 + i * 100;
            tracker.set_stage_objects("dev0", vec![obj(0.0, 1.0), obj(1.0, 1.0)], ts);
            frame = tracker.unite(ts);
        }
        assert_eq!(frame.len(), 1);
    }

    #[test]
    fn immobile_flag_after_timeout() {
        let mut tracker = MultiStageTracker::new(TrackParams {
            immobile_timeout: 1_000,
            immobile_distance: 0.5,
            min_active_time: 200,
            ..TrackParams::default()
        });
        tracker.trackable_mask = Some(Box::new(|_| 0));
        tracker.start(0);

        let frame = run_frames(&mut tracker, &[(0.0, 1.0); 20], 1_000, 100);
        let object = frame.objects.values().next().unwrap();
        assert!(object.flags & obj_flags::IMMOBILE != 0);
    }

    #[test]
    fn latent_shadow_objects_in_frame() {
        let mut tracker = MultiStageTracker::new(TrackParams {
            latent_distance: 0.5,
            keep_time: 200,
            min_active_time: 300,
            ..TrackParams::default()
        });
        tracker.start(0);

        let mut ts = 1_000;
        for _ in 0..8 {
            tracker.set_stage_objects("dev0", vec![obj(0.0, 1.0), obj(0.35, 1.0)], ts);
            tracker.unite(ts);
            ts += 100;
        }
        let mut frame = TrackedFrame::default();
        for _ in 0..8 {
            tracker.set_stage_objects("dev0", vec![obj(0.0, 1.0)], ts);
            frame = tracker.unite(ts);
            ts += 100;
        }
        // host plus the latent shadow riding on it
        assert_eq!(frame.len(), 2);
        assert_eq!(
            frame
                .objects
                .values()
                .filter(|object| object.is_latent())
                .count(),
            1
        );
    }
}
