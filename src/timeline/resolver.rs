//! Timeline resolution capability.
//!
//! The conductor only depends on the [`TimelineResolver`] trait. The
//! [`BasicResolver`] shipped here covers absolute, reference-expression and
//! grouped triggers, layer priority and keyframes, which is what the bundled
//! devices and the binary need.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use super::{
    Enable, EventKind, ResolvedObject, ResolvedTimes, TimelineEvent, TimelineObject,
    TimelineState, Trigger,
};
use crate::error::ResolveError;
use crate::types::Time;

/// Groups and objects expanded with their resolved bounds.
#[derive(Debug, Clone, Default)]
pub struct DevelopedTimeline {
    pub groups: Vec<ResolvedObject>,
    pub objects: Vec<ResolvedObject>,
}

impl DevelopedTimeline {
    pub fn group(&self, id: &str) -> Option<&ResolvedObject> {
        self.groups.iter().find(|g| g.id == id)
    }
}

/// External resolution capability consumed by the conductor.
pub trait TimelineResolver: Send + Sync {
    /// Resolved per-layer state at `time`.
    fn get_state(&self, timeline: &[TimelineObject], time: Time)
    -> Result<TimelineState, ResolveError>;

    /// The next `count` start/end events at or after `from`.
    fn get_next_events(
        &self,
        timeline: &[TimelineObject],
        from: Time,
        count: usize,
    ) -> Result<Vec<TimelineEvent>, ResolveError>;

    /// Timeline pruned to the objects relevant inside `[from, to]`.
    fn get_timeline_in_window(
        &self,
        timeline: &[TimelineObject],
        from: Option<Time>,
        to: Option<Time>,
    ) -> Result<Vec<TimelineObject>, ResolveError>;

    /// Expanded groups with resolved bounds, used while fixing "now" triggers.
    fn develop_timeline_around_time(
        &self,
        timeline: &[TimelineObject],
        time: Time,
    ) -> Result<DevelopedTimeline, ResolveError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BasicResolver;

impl BasicResolver {
    pub fn new() -> Self {
        Self
    }
}

struct Flat<'a> {
    obj: &'a TimelineObject,
    parent: Option<usize>,
}

fn flatten(timeline: &[TimelineObject]) -> Result<Vec<Flat<'_>>, ResolveError> {
    fn walk<'a>(
        objs: &'a [TimelineObject],
        parent: Option<usize>,
        out: &mut Vec<Flat<'a>>,
        seen: &mut HashSet<&'a str>,
    ) -> Result<(), ResolveError> {
        for obj in objs {
            if !seen.insert(obj.id.as_str()) {
                return Err(ResolveError::DuplicateId(obj.id.clone()));
            }
            let idx = out.len();
            out.push(Flat { obj, parent });
            walk(&obj.children, Some(idx), out, seen)?;
        }
        Ok(())
    }

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    walk(timeline, None, &mut out, &mut seen)?;
    Ok(out)
}

fn subtree_len(obj: &TimelineObject) -> usize {
    1 + obj.children.iter().map(subtree_len).sum::<usize>()
}

#[derive(Debug, Clone, PartialEq)]
enum Term {
    Number(Time),
    Start(String),
    End(String),
}

/// Parses `#id.start + 1000`-style expressions into signed terms.
fn parse_expression(expr: &str) -> Option<Vec<(Time, Term)>> {
    let chars: Vec<char> = expr.chars().collect();
    let mut terms = Vec::new();
    let mut i = 0;
    let mut sign = 1;
    let mut expect_term = true;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if !expect_term {
            match c {
                '+' => sign = 1,
                '-' => sign = -1,
                _ => return None,
            }
            expect_term = true;
            i += 1;
            continue;
        }
        match c {
            '+' => i += 1,
            '-' => {
                sign = -sign;
                i += 1;
            }
            '#' => {
                i += 1;
                let begin = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '-' | ':'))
                {
                    i += 1;
                }
                let id: String = chars[begin..i].iter().collect();
                if id.is_empty() {
                    return None;
                }
                let term = if i < chars.len() && chars[i] == '.' {
                    i += 1;
                    let begin = i;
                    while i < chars.len() && chars[i].is_ascii_alphabetic() {
                        i += 1;
                    }
                    match chars[begin..i].iter().collect::<String>().as_str() {
                        "start" => Term::Start(id),
                        "end" => Term::End(id),
                        _ => return None,
                    }
                } else {
                    Term::Start(id)
                };
                terms.push((sign, term));
                sign = 1;
                expect_term = false;
            }
            d if d.is_ascii_digit() => {
                let begin = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let n: Time = chars[begin..i].iter().collect::<String>().parse().ok()?;
                terms.push((sign, Term::Number(n)));
                sign = 1;
                expect_term = false;
            }
            _ => return None,
        }
    }

    if expect_term { None } else { Some(terms) }
}

struct Resolution<'a> {
    flat: Vec<Flat<'a>>,
    times: Vec<Option<ResolvedTimes>>,
}

impl<'a> Resolution<'a> {
    fn new(timeline: &'a [TimelineObject]) -> Result<Self, ResolveError> {
        let flat = flatten(timeline)?;
        let index: HashMap<&str, usize> = flat
            .iter()
            .enumerate()
            .map(|(i, f)| (f.obj.id.as_str(), i))
            .collect();
        let mut times: Vec<Option<ResolvedTimes>> = vec![None; flat.len()];

        // Fixed point: every sweep resolves whatever became resolvable.
        loop {
            let mut progress = false;
            for i in 0..flat.len() {
                if times[i].is_some() {
                    continue;
                }
                let (parent_start, parent_end) = match flat[i].parent {
                    None => (0, None),
                    Some(p) => match times[p] {
                        Some(t) => (t.start, t.end),
                        None => continue,
                    },
                };
                let obj = flat[i].obj;
                let Some(start) =
                    eval_trigger(&obj.enable.start, parent_start, &obj.id, &index, &times)?
                else {
                    continue;
                };
                let end = match &obj.enable.end {
                    Some(trigger) => {
                        match eval_trigger(trigger, parent_start, &obj.id, &index, &times)? {
                            Some(end) => Some(end),
                            None => continue,
                        }
                    }
                    None => obj.enable.duration.map(|d| start + d),
                };
                let end = match (end, parent_end) {
                    (Some(e), Some(pe)) => Some(e.min(pe)),
                    (None, Some(pe)) => Some(pe),
                    (e, None) => e,
                };
                times[i] = Some(ResolvedTimes {
                    start,
                    end: end.map(|e| e.max(start)),
                });
                progress = true;
            }
            if !progress {
                break;
            }
        }

        Ok(Self { flat, times })
    }

    fn is_active(&self, i: usize, time: Time) -> bool {
        let mut cursor = Some(i);
        while let Some(idx) = cursor {
            match self.times[idx] {
                Some(t) if t.contains(time) => cursor = self.flat[idx].parent,
                _ => return false,
            }
        }
        true
    }

    fn resolved_object(&self, i: usize, time: Option<Time>) -> Option<ResolvedObject> {
        let times = self.times[i]?;
        let obj = self.flat[i].obj;
        let mut content = obj.content.clone();
        if let Some(time) = time {
            for keyframe in &obj.keyframes {
                if let Some(kf) = self.keyframe_times(&keyframe.enable, times) {
                    if kf.contains(time) {
                        for (k, v) in &keyframe.content {
                            content.attributes.insert(k.clone(), v.clone());
                        }
                    }
                }
            }
        }
        Some(ResolvedObject {
            id: obj.id.clone(),
            layer: obj.layer.clone(),
            original_layer: obj
                .content
                .attributes
                .get("originalLayer")
                .and_then(Value::as_str)
                .map(str::to_string),
            parent_id: self.flat[i].parent.map(|p| self.flat[p].obj.id.clone()),
            is_group: obj.is_group,
            priority: obj.priority,
            content,
            resolved: times,
        })
    }

    fn keyframe_times(&self, enable: &Enable, owner: ResolvedTimes) -> Option<ResolvedTimes> {
        let start = match &enable.start {
            Trigger::Absolute(v) => owner.start + v,
            _ => return None,
        };
        let end = match &enable.end {
            Some(Trigger::Absolute(v)) => Some(owner.start + v),
            Some(_) => return None,
            None => enable.duration.map(|d| start + d).or(owner.end),
        };
        Some(ResolvedTimes { start, end })
    }

    /// Re-emit `obj` with resolved triggers rewritten to absolute values.
    fn absolutize(
        &self,
        obj: &TimelineObject,
        cursor: &mut usize,
        parent_start: Option<Time>,
    ) -> TimelineObject {
        let idx = *cursor;
        *cursor += 1;
        let times = self.times[idx];
        let mut out = obj.clone();
        if let Some(t) = times {
            let base = parent_start.unwrap_or(0);
            out.enable = Enable {
                start: Trigger::Absolute(t.start - base),
                end: t.end.map(|e| Trigger::Absolute(e - base)),
                duration: None,
            };
        }
        let own_start = times.map(|t| t.start);
        out.children = obj
            .children
            .iter()
            .map(|child| self.absolutize(child, cursor, own_start))
            .collect();
        out
    }
}

fn eval_trigger(
    trigger: &Trigger,
    parent_start: Time,
    object_id: &str,
    index: &HashMap<&str, usize>,
    times: &[Option<ResolvedTimes>],
) -> Result<Option<Time>, ResolveError> {
    match trigger {
        Trigger::Absolute(v) => Ok(Some(parent_start + v)),
        Trigger::Now => Ok(None),
        Trigger::Expression(expr) => {
            let terms = parse_expression(expr).ok_or_else(|| ResolveError::InvalidExpression {
                object_id: object_id.to_string(),
                expression: expr.clone(),
            })?;
            let mut total = 0;
            let mut has_reference = false;
            for (sign, term) in terms {
                let value = match term {
                    Term::Number(n) => n,
                    Term::Start(id) | Term::End(id) if id == object_id => return Ok(None),
                    Term::Start(id) => {
                        has_reference = true;
                        match index.get(id.as_str()).and_then(|&i| times[i]) {
                            Some(t) => t.start,
                            None => return Ok(None),
                        }
                    }
                    Term::End(id) => {
                        has_reference = true;
                        match index.get(id.as_str()).and_then(|&i| times[i]).and_then(|t| t.end) {
                            Some(end) => end,
                            None => return Ok(None),
                        }
                    }
                };
                total += sign * value;
            }
            if has_reference {
                Ok(Some(total))
            } else {
                Ok(Some(parent_start + total))
            }
        }
    }
}

impl TimelineResolver for BasicResolver {
    fn get_state(
        &self,
        timeline: &[TimelineObject],
        time: Time,
    ) -> Result<TimelineState, ResolveError> {
        let resolution = Resolution::new(timeline)?;
        let mut winners: HashMap<&str, usize> = HashMap::new();

        for (i, flat) in resolution.flat.iter().enumerate() {
            if flat.obj.layer.is_empty() || !resolution.is_active(i, time) {
                continue;
            }
            let rank = |idx: usize| {
                let obj = resolution.flat[idx].obj;
                let start = resolution.times[idx].map(|t| t.start).unwrap_or(Time::MIN);
                (obj.priority, start, obj.id.as_str())
            };
            match winners.get(flat.obj.layer.as_str()) {
                Some(&current) if rank(current) >= rank(i) => {}
                _ => {
                    winners.insert(flat.obj.layer.as_str(), i);
                }
            }
        }

        let mut state = TimelineState::empty(time);
        for (layer, i) in winners {
            if let Some(obj) = resolution.resolved_object(i, Some(time)) {
                state.layers.insert(layer.to_string(), obj);
            }
        }
        Ok(state)
    }

    fn get_next_events(
        &self,
        timeline: &[TimelineObject],
        from: Time,
        count: usize,
    ) -> Result<Vec<TimelineEvent>, ResolveError> {
        let resolution = Resolution::new(timeline)?;
        let mut events = Vec::new();
        let mut push = |time: Time, kind: EventKind, id: &str| {
            if time >= from {
                events.push(TimelineEvent {
                    time,
                    kind,
                    object_id: id.to_string(),
                });
            }
        };

        for (i, flat) in resolution.flat.iter().enumerate() {
            let Some(times) = resolution.times[i] else {
                continue;
            };
            push(times.start, EventKind::Start, &flat.obj.id);
            if let Some(end) = times.end {
                push(end, EventKind::End, &flat.obj.id);
            }
            for keyframe in &flat.obj.keyframes {
                if let Some(kf) = resolution.keyframe_times(&keyframe.enable, times) {
                    push(kf.start, EventKind::Start, &keyframe.id);
                    if let Some(end) = kf.end {
                        push(end, EventKind::End, &keyframe.id);
                    }
                }
            }
        }

        events.sort_by(|a, b| {
            (a.time, a.kind, &a.object_id).cmp(&(b.time, b.kind, &b.object_id))
        });
        events.truncate(count);
        Ok(events)
    }

    fn get_timeline_in_window(
        &self,
        timeline: &[TimelineObject],
        from: Option<Time>,
        to: Option<Time>,
    ) -> Result<Vec<TimelineObject>, ResolveError> {
        let resolution = Resolution::new(timeline)?;
        let from = from.unwrap_or(Time::MIN);
        let to = to.unwrap_or(Time::MAX);

        let mut cursor = 0;
        let mut pruned = Vec::new();
        for obj in timeline {
            let keep = match resolution.times[cursor] {
                Some(times) => times.overlaps(from, to),
                None => true,
            };
            if keep {
                pruned.push(resolution.absolutize(obj, &mut cursor, None));
            } else {
                cursor += subtree_len(obj);
            }
        }
        Ok(pruned)
    }

    fn develop_timeline_around_time(
        &self,
        timeline: &[TimelineObject],
        time: Time,
    ) -> Result<DevelopedTimeline, ResolveError> {
        let resolution = Resolution::new(timeline)?;
        let mut developed = DevelopedTimeline::default();
        for i in 0..resolution.flat.len() {
            if let Some(obj) = resolution.resolved_object(i, Some(time)) {
                if obj.is_group {
                    developed.groups.push(obj);
                } else {
                    developed.objects.push(obj);
                }
            }
        }
        Ok(developed)
    }
}
