//! Turns low-level pointer and touch events on calendar cells into one
//! discrete action per interaction.
//!
//! A session arms on pointer-down over a selectable cell. Movement past the
//! drag threshold turns it into a drag; on touch, mostly-vertical movement is
//! a page scroll and cancels the session instead. Releasing an armed session,
//! or a drag that never left its anchor, yields a tap.

use crate::domain::models::{SelectionBounds, VoteKind};
use chrono::NaiveDate;
use serde::Serialize;

pub const DEFAULT_DRAG_THRESHOLD_PX: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    Mouse,
    Touch,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointerEvent {
    Down {
        date: NaiveDate,
        pointer: PointerKind,
        position: Option<Point>,
    },
    /// `over` is the cell under the pointer after hit-testing, if any.
    Move {
        position: Point,
        over: Option<NaiveDate>,
    },
    /// The pointer entered another cell (mouse hover while pressed).
    Enter { date: NaiveDate },
    Up,
    Cancel,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DragIntent {
    Add,
    Remove,
}

impl DragIntent {
    /// Remove when the viewer's vote on the anchor already matches the mode.
    pub fn for_anchor(anchor_vote: Option<VoteKind>, mode: VoteKind) -> Self {
        if anchor_vote == Some(mode) {
            DragIntent::Remove
        } else {
            DragIntent::Add
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GestureAction {
    Tap(NaiveDate),
    DragRange {
        dates: Vec<NaiveDate>,
        intent: DragIntent,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GesturePhase {
    Idle,
    Armed,
    Dragging,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GestureSession {
    pub anchor: NaiveDate,
    pub current: NaiveDate,
    pub intent: DragIntent,
    pub origin: Option<Point>,
    pub started: bool,
    pub pointer: PointerKind,
}

/// Live highlight state while a drag is open.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DragPreview {
    pub dates: Vec<NaiveDate>,
    pub intent: DragIntent,
}

pub struct GestureContext<'a> {
    pub bounds: SelectionBounds,
    pub mode: VoteKind,
    pub own_vote: &'a dyn Fn(NaiveDate) -> Option<VoteKind>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Idle,
    Armed(GestureSession),
    Dragging(GestureSession),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct GestureRecognizer {
    threshold_px: f64,
    state: State,
}

impl Default for GestureRecognizer {
    fn default() -> Self {
        Self::new(DEFAULT_DRAG_THRESHOLD_PX)
    }
}

impl GestureRecognizer {
    pub fn new(threshold_px: f64) -> Self {
        Self {
            threshold_px: threshold_px.max(0.0),
            state: State::Idle,
        }
    }

    pub fn phase(&self) -> GesturePhase {
        match self.state {
            State::Idle => GesturePhase::Idle,
            State::Armed(_) => GesturePhase::Armed,
            State::Dragging(_) => GesturePhase::Dragging,
            State::Cancelled => GesturePhase::Cancelled,
        }
    }

    pub fn session(&self) -> Option<&GestureSession> {
        match &self.state {
            State::Armed(session) | State::Dragging(session) => Some(session),
            State::Idle | State::Cancelled => None,
        }
    }

    pub fn preview(&self) -> Option<DragPreview> {
        match &self.state {
            State::Dragging(session) => Some(DragPreview {
                dates: inclusive_range(session.anchor, session.current),
                intent: session.intent,
            }),
            _ => None,
        }
    }

    /// Intent of the open drag if `date` is inside its highlighted range.
    pub fn highlight(&self, date: NaiveDate) -> Option<DragIntent> {
        match &self.state {
            State::Dragging(session) => {
                let (low, high) = ordered(session.anchor, session.current);
                (low <= date && date <= high).then_some(session.intent)
            }
            _ => None,
        }
    }

    pub fn handle(&mut self, event: PointerEvent, context: &GestureContext<'_>) -> Option<GestureAction> {
        match event {
            PointerEvent::Down {
                date,
                pointer,
                position,
            } => {
                self.pointer_down(date, pointer, position, context);
                None
            }
            PointerEvent::Move { position, over } => {
                self.pointer_move(position, over, context);
                None
            }
            PointerEvent::Enter { date } => {
                self.pointer_enter(date, context);
                None
            }
            PointerEvent::Up => self.pointer_up(),
            PointerEvent::Cancel => {
                self.state = State::Idle;
                None
            }
        }
    }

    fn pointer_down(
        &mut self,
        date: NaiveDate,
        pointer: PointerKind,
        position: Option<Point>,
        context: &GestureContext<'_>,
    ) {
        if self.state != State::Idle {
            return;
        }
        if !context.bounds.is_selectable(date) {
            return;
        }
        let intent = DragIntent::for_anchor((context.own_vote)(date), context.mode);
        self.state = State::Armed(GestureSession {
            anchor: date,
            current: date,
            intent,
            origin: position,
            started: false,
            pointer,
        });
    }

    fn pointer_move(&mut self, position: Point, over: Option<NaiveDate>, context: &GestureContext<'_>) {
        match self.state {
            State::Armed(mut session) => {
                let Some(origin) = session.origin else {
                    session.origin = Some(position);
                    self.state = State::Armed(session);
                    if let Some(date) = over.filter(|date| *date != session.anchor) {
                        self.pointer_enter(date, context);
                    }
                    return;
                };
                let dx = (position.x - origin.x).abs();
                let dy = (position.y - origin.y).abs();
                if dx.hypot(dy) <= self.threshold_px {
                    return;
                }
                if session.pointer == PointerKind::Touch && dy > dx {
                    self.state = State::Cancelled;
                    return;
                }
                session.started = true;
                if let Some(date) = over.filter(|date| context.bounds.is_selectable(*date)) {
                    session.current = date;
                }
                self.state = State::Dragging(session);
            }
            State::Dragging(mut session) => {
                if let Some(date) = over.filter(|date| context.bounds.is_selectable(*date)) {
                    session.current = date;
                    self.state = State::Dragging(session);
                }
            }
            State::Idle | State::Cancelled => {}
        }
    }

    fn pointer_enter(&mut self, date: NaiveDate, context: &GestureContext<'_>) {
        if !context.bounds.is_selectable(date) {
            return;
        }
        match self.state {
            // Touch only starts dragging through the threshold check in Move.
            State::Armed(mut session)
                if session.pointer == PointerKind::Mouse && date != session.anchor =>
            {
                session.started = true;
                session.current = date;
                self.state = State::Dragging(session);
            }
            State::Dragging(mut session) => {
                session.current = date;
                self.state = State::Dragging(session);
            }
            _ => {}
        }
    }

    fn pointer_up(&mut self) -> Option<GestureAction> {
        let state = std::mem::replace(&mut self.state, State::Idle);
        match state {
            State::Armed(session) => Some(GestureAction::Tap(session.anchor)),
            State::Dragging(session) if session.current == session.anchor => {
                Some(GestureAction::Tap(session.anchor))
            }
            State::Dragging(session) => Some(GestureAction::DragRange {
                dates: inclusive_range(session.anchor, session.current),
                intent: session.intent,
            }),
            State::Idle | State::Cancelled => None,
        }
    }
}

fn ordered(a: NaiveDate, b: NaiveDate) -> (NaiveDate, NaiveDate) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Every date between `a` and `b` inclusive, ascending, whichever comes first.
pub fn inclusive_range(a: NaiveDate, b: NaiveDate) -> Vec<NaiveDate> {
    let (low, high) = ordered(a, b);
    low.iter_days().take_while(|date| *date <= high).collect()
}
