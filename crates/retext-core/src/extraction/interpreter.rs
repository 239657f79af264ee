//! Content stream interpreter
//!
//! Walks the decoded operators of a page and tracks just enough graphics and
//! text state to place every shown glyph in user space. Produces one
//! [`TextRun`] per text-showing operator and one [`FilledRect`] per filled
//! rectangle.

use super::font::FontInfo;
use super::{FilledRect, GlyphRef, RunChar, TextRun};
use crate::geometry::{Color, Matrix, Rect};
use lopdf::content::Operation;
use lopdf::Object;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct GraphicsState {
    ctm: Matrix,
    fill: Color,
    font: Option<String>,
    font_size: f64,
    char_spacing: f64,
    word_spacing: f64,
    h_scale: f64,
    leading: f64,
    rise: f64,
}

impl Default for GraphicsState {
    fn default() -> Self {
        Self {
            ctm: Matrix::IDENTITY,
            fill: Color::BLACK,
            font: None,
            font_size: 0.0,
            char_spacing: 0.0,
            word_spacing: 0.0,
            h_scale: 1.0,
            leading: 0.0,
            rise: 0.0,
        }
    }
}

pub(crate) struct Interpreter<'a> {
    fonts: &'a BTreeMap<String, FontInfo>,
    fallback_font: FontInfo,
    state: GraphicsState,
    stack: Vec<GraphicsState>,
    tm: Matrix,
    tlm: Matrix,
    path_rects: Vec<Rect>,
    runs: Vec<TextRun>,
    fills: Vec<FilledRect>,
}

impl<'a> Interpreter<'a> {
    pub(crate) fn new(fonts: &'a BTreeMap<String, FontInfo>) -> Self {
        Self {
            fonts,
            fallback_font: FontInfo::unknown(),
            state: GraphicsState::default(),
            stack: Vec::new(),
            tm: Matrix::IDENTITY,
            tlm: Matrix::IDENTITY,
            path_rects: Vec::new(),
            runs: Vec::new(),
            fills: Vec::new(),
        }
    }

    pub(crate) fn run(mut self, operations: &[Operation]) -> (Vec<TextRun>, Vec<FilledRect>) {
        for (index, op) in operations.iter().enumerate() {
            self.step(index, op);
        }
        (self.runs, self.fills)
    }

    fn step(&mut self, index: usize, op: &Operation) {
        let nums = numbers(&op.operands);
        match op.operator.as_str() {
            "q" => self.stack.push(self.state.clone()),
            "Q" => {
                if let Some(saved) = self.stack.pop() {
                    self.state = saved;
                }
            }
            "cm" => {
                if let [a, b, c, d, e, f] = nums[..] {
                    self.state.ctm = Matrix::new(a, b, c, d, e, f).then(&self.state.ctm);
                }
            }

            "BT" => {
                self.tm = Matrix::IDENTITY;
                self.tlm = Matrix::IDENTITY;
            }
            "ET" => {}
            "Tf" => {
                if let Some(Object::Name(name)) = op.operands.first() {
                    self.state.font = Some(String::from_utf8_lossy(name).into_owned());
                }
                if let Some(size) = op.operands.get(1).and_then(number) {
                    self.state.font_size = size;
                }
            }
            "Tc" => {
                if let [v] = nums[..] {
                    self.state.char_spacing = v;
                }
            }
            "Tw" => {
                if let [v] = nums[..] {
                    self.state.word_spacing = v;
                }
            }
            "Tz" => {
                if let [v] = nums[..] {
                    self.state.h_scale = v / 100.0;
                }
            }
            "TL" => {
                if let [v] = nums[..] {
                    self.state.leading = v;
                }
            }
            "Ts" => {
                if let [v] = nums[..] {
                    self.state.rise = v;
                }
            }
            "Td" => {
                if let [tx, ty] = nums[..] {
                    self.move_line(tx, ty);
                }
            }
            "TD" => {
                if let [tx, ty] = nums[..] {
                    self.state.leading = -ty;
                    self.move_line(tx, ty);
                }
            }
            "Tm" => {
                if let [a, b, c, d, e, f] = nums[..] {
                    self.tm = Matrix::new(a, b, c, d, e, f);
                    self.tlm = self.tm;
                }
            }
            "T*" => self.next_line(),

            "Tj" => self.show_operand(index, op, 0),
            "'" => {
                self.next_line();
                self.show_operand(index, op, 0);
            }
            "\"" => {
                if let (Some(aw), Some(ac)) = (
                    op.operands.first().and_then(number),
                    op.operands.get(1).and_then(number),
                ) {
                    self.state.word_spacing = aw;
                    self.state.char_spacing = ac;
                }
                self.next_line();
                self.show_operand(index, op, 2);
            }
            "TJ" => self.show_array(index, op),

            "g" => {
                if let [v] = nums[..] {
                    self.state.fill = Color::gray(v);
                }
            }
            "rg" => {
                if let [r, g, b] = nums[..] {
                    self.state.fill = Color::rgb(r, g, b);
                }
            }
            "k" => {
                if let [c, m, y, k] = nums[..] {
                    self.state.fill = Color::cmyk(c, m, y, k);
                }
            }
            "sc" | "scn" => {
                // Pattern fills carry a trailing name and are left alone
                if !op.operands.iter().any(|o| matches!(o, Object::Name(_))) {
                    if let Some(color) = Color::from_components(&nums) {
                        self.state.fill = color;
                    }
                }
            }

            "re" => {
                if let [x, y, w, h] = nums[..] {
                    let corners = [
                        self.state.ctm.apply(x, y),
                        self.state.ctm.apply(x + w, y),
                        self.state.ctm.apply(x, y + h),
                        self.state.ctm.apply(x + w, y + h),
                    ];
                    let x0 = corners.iter().map(|c| c.0).fold(f64::INFINITY, f64::min);
                    let x1 = corners.iter().map(|c| c.0).fold(f64::NEG_INFINITY, f64::max);
                    let y0 = corners.iter().map(|c| c.1).fold(f64::INFINITY, f64::min);
                    let y1 = corners.iter().map(|c| c.1).fold(f64::NEG_INFINITY, f64::max);
                    self.path_rects.push(Rect::new(x0, y0, x1, y1));
                }
            }
            "f" | "F" | "f*" | "B" | "B*" | "b" | "b*" => {
                for rect in self.path_rects.drain(..) {
                    self.fills.push(FilledRect {
                        rect,
                        color: self.state.fill,
                        op_index: index,
                    });
                }
            }
            "n" | "S" | "s" => self.path_rects.clear(),
            _ => {}
        }
    }

    fn move_line(&mut self, tx: f64, ty: f64) {
        self.tlm = Matrix::translate(tx, ty).then(&self.tlm);
        self.tm = self.tlm;
    }

    fn next_line(&mut self) {
        let leading = self.state.leading;
        self.move_line(0.0, -leading);
    }

    fn show_operand(&mut self, index: usize, op: &Operation, operand: usize) {
        if let Some(Object::String(bytes, _)) = op.operands.get(operand) {
            let mut run = self.begin_run(index);
            self.show_string(&mut run, bytes, operand, None);
            self.finish_run(run);
        }
    }

    fn show_array(&mut self, index: usize, op: &Operation) {
        let Some(Object::Array(items)) = op.operands.first() else {
            return;
        };
        let mut run = self.begin_run(index);
        for (element, item) in items.iter().enumerate() {
            match item {
                Object::String(bytes, _) => self.show_string(&mut run, bytes, 0, Some(element)),
                other => {
                    if let Some(n) = number(other) {
                        let tx = -n / 1000.0 * self.state.font_size * self.state.h_scale;
                        self.tm = Matrix::translate(tx, 0.0).then(&self.tm);
                    }
                }
            }
        }
        self.finish_run(run);
    }

    fn begin_run(&self, op_index: usize) -> TextRun {
        let font_resource = self.state.font.clone().unwrap_or_default();
        let font = self.current_font();
        let trm = self.tm.then(&self.state.ctm);
        let (_, baseline) = trm.apply(0.0, self.state.rise);
        TextRun {
            op_index,
            text: String::new(),
            chars: Vec::new(),
            glyphs: Vec::new(),
            baseline,
            font_resource,
            base_font: font.base_font.clone(),
            standard_font: font.standard_name(),
            font_size: self.state.font_size * trm.vertical_scale(),
            text_font_size: self.state.font_size,
            color: self.state.fill,
            line: 0,
            exact_metrics: true,
            axis_aligned: trm.is_axis_aligned() && trm.a > 0.0 && trm.d > 0.0,
        }
    }

    fn finish_run(&mut self, run: TextRun) {
        if !run.glyphs.is_empty() {
            self.runs.push(run);
        }
    }

    fn current_font(&self) -> &FontInfo {
        self.state
            .font
            .as_ref()
            .and_then(|name| self.fonts.get(name))
            .unwrap_or(&self.fallback_font)
    }

    fn show_string(&mut self, run: &mut TextRun, bytes: &[u8], operand: usize, element: Option<usize>) {
        let glyphs = self.current_font().decode(bytes);
        let size = self.state.font_size;
        let h_scale = self.state.h_scale;

        for glyph in glyphs {
            let word_spacing = if glyph.is_word_space {
                self.state.word_spacing
            } else {
                0.0
            };
            let trm = self.tm.then(&self.state.ctm);
            let (x0, _) = trm.apply(0.0, self.state.rise);
            let (x1, _) = trm.apply(glyph.width / 1000.0 * size * h_scale, self.state.rise);

            let advance_units = if size.abs() > f64::EPSILON {
                glyph.width + (self.state.char_spacing + word_spacing) * 1000.0 / size
            } else {
                glyph.width
            };
            let glyph_index = run.glyphs.len();
            run.glyphs.push(GlyphRef {
                operand,
                element,
                byte_start: glyph.byte_start,
                byte_end: glyph.byte_end,
                advance_units,
            });
            run.exact_metrics &= glyph.exact;

            let count = glyph.text.chars().count().max(1) as f64;
            let step = (x1 - x0) / count;
            for (i, ch) in glyph.text.chars().enumerate() {
                run.text.push(ch);
                run.chars.push(RunChar {
                    ch,
                    x0: x0 + step * i as f64,
                    x1: x0 + step * (i + 1) as f64,
                    glyph: glyph_index,
                });
            }

            let tx = (glyph.width / 1000.0 * size + self.state.char_spacing + word_spacing) * h_scale;
            self.tm = Matrix::translate(tx, 0.0).then(&self.tm);
        }
    }
}

fn number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(f) => Some(*f as f64),
        _ => None,
    }
}

fn numbers(operands: &[Object]) -> Vec<f64> {
    operands.iter().filter_map(number).collect()
}
