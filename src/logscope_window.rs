//! Virtual windowing over a long list of fixed-height rows.

use crate::logscope_core::Viewport;

pub const DEFAULT_BUFFER_ROWS: usize = 10;
/// Remaining rows below the viewport at which more data is requested.
pub const NEAR_END_ROWS: usize = 3;

/// Rows `[start, end)` to materialize.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub start: usize,
    pub end: usize,
    pub need_more: bool,
}

impl Window {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Computes the materialized row range for a scroll position.
///
/// `scroll_offset` and `viewport_height` are in the same unit as
/// `row_height` (pixels, terminal lines, ...).
pub fn compute_window(
    scroll_offset: usize,
    viewport_height: usize,
    row_height: usize,
    total_rows: usize,
    buffer_rows: usize,
) -> Window {
    let row_height = row_height.max(1);
    let first_visible = (scroll_offset / row_height).min(total_rows);
    let visible_rows = viewport_height.div_ceil(row_height);
    let last_visible = first_visible.saturating_add(visible_rows).min(total_rows);

    let start = first_visible.saturating_sub(buffer_rows);
    let end = last_visible.saturating_add(buffer_rows).min(total_rows);

    let content_height = total_rows.saturating_mul(row_height);
    let viewed_until = scroll_offset.saturating_add(viewport_height);
    let remaining = content_height.saturating_sub(viewed_until);
    let need_more = total_rows == 0 || remaining <= NEAR_END_ROWS.saturating_mul(row_height);

    Window { start, end, need_more }
}

/// Scroll position of a list measured in rows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScrollState {
    pub offset: usize,
    pub viewport_height: usize,
    pub row_height: usize,
    pub buffer_rows: usize,
}

impl Default for ScrollState {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_ROWS)
    }
}

impl ScrollState {
    pub fn new(buffer_rows: usize) -> Self {
        Self { offset: 0, viewport_height: 0, row_height: 1, buffer_rows }
    }

    pub fn window(&self, total_rows: usize) -> Window {
        compute_window(
            self.offset,
            self.viewport_height,
            self.row_height,
            total_rows,
            self.buffer_rows,
        )
    }

    pub fn set_viewport_height(&mut self, height: usize) {
        self.viewport_height = height;
    }

    /// Keeps the offset inside the content after the row count changed.
    pub fn clamp_to(&mut self, total_rows: usize) {
        self.clamp(total_rows);
    }

    pub fn scroll_by(&mut self, delta: isize, total_rows: usize) {
        self.offset = if delta.is_negative() {
            self.offset.saturating_sub(delta.unsigned_abs())
        } else {
            self.offset.saturating_add(delta as usize)
        };
        self.clamp(total_rows);
    }

    pub fn scroll_to_top(&mut self) {
        self.offset = 0;
    }

    pub fn scroll_to_bottom(&mut self, total_rows: usize) {
        self.offset = self.max_offset(total_rows);
    }

    /// Moves the offset the least amount that keeps `selected` visible.
    pub fn follow(&mut self, selected: usize, total_rows: usize) {
        let rows = self.visible_rows();
        if rows == 0 {
            return;
        }
        let row = selected.saturating_mul(self.row_height.max(1));
        if row < self.offset {
            self.offset = row;
        } else {
            let bottom = row.saturating_add(self.row_height.max(1));
            let viewed_until = self.offset.saturating_add(self.viewport_height);
            if bottom > viewed_until {
                self.offset = bottom.saturating_sub(self.viewport_height);
            }
        }
        self.clamp(total_rows);
    }

    pub fn first_visible_row(&self) -> usize {
        self.offset / self.row_height.max(1)
    }

    pub fn visible_rows(&self) -> usize {
        self.viewport_height / self.row_height.max(1)
    }

    fn max_offset(&self, total_rows: usize) -> usize {
        total_rows.saturating_mul(self.row_height.max(1)).saturating_sub(self.viewport_height)
    }

    fn clamp(&mut self, total_rows: usize) {
        self.offset = self.offset.min(self.max_offset(total_rows));
    }
}

impl Viewport for ScrollState {
    fn at_top(&self) -> bool {
        self.offset == 0
    }

    fn near_end(&self, loaded: usize) -> bool {
        self.viewport_height > 0 && self.window(loaded).need_more
    }
}

/// Viewport of a consumer that wants a fixed number of rows and never
/// scrolls, such as a one-shot search.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pinned {
    wanted: usize,
}

impl Pinned {
    pub fn new(wanted: usize) -> Self {
        Self { wanted }
    }

    pub fn wanted(&self) -> usize {
        self.wanted
    }
}

impl Viewport for Pinned {
    fn at_top(&self) -> bool {
        true
    }

    fn near_end(&self, loaded: usize) -> bool {
        loaded < self.wanted
    }
}
