//! Extraction of crash reasons from debugger backtrace output.
//!
//! Every debugger format is described by a set of [`BacktraceRules`]: markers delimiting the
//! exception code and the call stack, and per-frame callbacks that join wrapped lines, strip
//! volatile details and tell whether a frame carries symbol information.

use crate::report::{Component, Extension, Report};

use super::{AnalysisError, Reason};

/// Parsing rules of a single debugger output format.
pub trait BacktraceRules {
    /// Text immediately preceding the exception code.
    const CODE_BEGIN: &'static str;
    /// Text immediately following the exception code.
    const CODE_END: &'static str;
    /// Header of the call stack; the stack starts on the line after it.
    const STACK_BEGIN: &'static str;
    /// Text terminating the call stack.
    const STACK_END: &'static str;

    /// Whether `line` starts a new frame rather than continuing the previous one.
    fn is_new_line(&self, line: &str) -> bool;

    /// Canonicalises a frame.
    fn transform(&self, frame: String) -> String;

    /// Whether a canonical frame has symbol information.
    fn is_resolved(&self, frame: &str) -> bool;
}

/// Rules for `bt` output of gdb on Linux.
#[derive(Clone, Copy, Debug, Default)]
pub struct GdbRules;

impl BacktraceRules for GdbRules {
    const CODE_BEGIN: &'static str = "Program terminated with signal ";
    const CODE_END: &'static str = ".";
    const STACK_BEGIN: &'static str = "Thread 1 ";
    const STACK_END: &'static str = "\n(gdb)";

    fn is_new_line(&self, line: &str) -> bool {
        ["#", "Backtrace stopped", "(More stack"]
            .iter()
            .any(|prefix| line.starts_with(prefix))
    }

    /// Removes argument values, so frames differing only in runtime values compare equal.
    fn transform(&self, mut frame: String) -> String {
        let mut begin = 0;
        while let Some(position) = frame[begin..].find('=') {
            begin += position + 1;
            let end = frame[begin..]
                .find(',')
                .or_else(|| frame[begin..].find(')'))
                .map(|offset| begin + offset);
            if let Some(end) = end {
                frame.replace_range(begin..end, "");
            }
        }
        frame
    }

    fn is_resolved(&self, frame: &str) -> bool {
        // gdb prints `??` in place of unknown function names.
        frame.starts_with('#') && !frame.contains("??")
    }
}

/// Rules for `kc` output of cdb on Windows.
#[derive(Clone, Debug)]
pub struct CdbRules {
    binary: String,
    component: Component,
}

impl CdbRules {
    pub fn new(binary: impl Into<String>, component: Component) -> Self {
        Self {
            binary: binary.into(),
            component,
        }
    }
}

impl BacktraceRules for CdbRules {
    const CODE_BEGIN: &'static str = "ExceptionCode: ";
    const CODE_END: &'static str = "\n";
    const STACK_BEGIN: &'static str = "Call Site";
    const STACK_END: &'static str = "\n\n";

    fn is_new_line(&self, _line: &str) -> bool {
        true
    }

    /// Replaces the branded executable name with the component name.
    fn transform(&self, frame: String) -> String {
        match frame
            .strip_prefix(self.binary.as_str())
            .filter(|rest| rest.starts_with('!'))
        {
            Some(rest) => format!("{}{rest}", self.component),
            None => frame,
        }
    }

    fn is_resolved(&self, frame: &str) -> bool {
        let Some((module, _function)) = frame.split_once('!') else {
            return false;
        };
        module.starts_with(self.component.as_str()) || module.starts_with("nx_")
    }
}

/// Backtrace rules selected by report extension.
#[derive(Clone, Debug)]
pub enum Rules {
    Gdb(GdbRules),
    Cdb(CdbRules),
}

impl Rules {
    /// Rules for the backtrace text of `report`.
    ///
    /// Minidumps are described by the rules of the cdb text generated from them.
    pub fn for_report(report: &Report) -> Self {
        match report.extension() {
            Extension::GdbBt => Self::Gdb(GdbRules),
            Extension::CdbBt | Extension::Dmp => {
                Self::Cdb(CdbRules::new(report.binary(), report.component()))
            }
        }
    }

    /// Extracts the crash reason of `component` from backtrace `content`.
    pub fn parse(&self, component: Component, content: &str) -> Result<Reason, AnalysisError> {
        match self {
            Self::Gdb(rules) => parse(rules, component, content),
            Self::Cdb(rules) => parse(rules, component, content),
        }
    }
}

/// Returns the text between `begin` and `end`.
///
/// With `skip_line`, the text starts on the line following `begin`.
fn cut<'a>(content: &'a str, begin: &str, end: &str, skip_line: bool) -> Option<&'a str> {
    let mut start = content.find(begin)? + begin.len();
    if skip_line {
        start += content[start..].find('\n')? + 1;
    }
    let stop = start + content[start..].find(end)?;
    Some(&content[start..stop])
}

/// Extracts a [`Reason`] from backtrace `content` using `rules`.
pub fn parse<R: BacktraceRules>(
    rules: &R,
    component: Component,
    content: &str,
) -> Result<Reason, AnalysisError> {
    let content = content.replace('\r', "");

    let code = cut(&content, R::CODE_BEGIN, R::CODE_END, false)
        .filter(|code| !code.is_empty())
        .ok_or(AnalysisError::CodeNotFound)?;

    let stack_content = cut(&content, R::STACK_BEGIN, R::STACK_END, true)
        .filter(|stack| !stack.is_empty())
        .ok_or(AnalysisError::StackNotFound)?;

    let mut frames: Vec<String> = Vec::new();
    for line in stack_content.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if rules.is_new_line(line) {
            frames.push(line.to_owned());
        } else if let Some(frame) = frames.last_mut() {
            frame.push(' ');
            frame.push_str(line);
        } else {
            tracing::trace!("Skipping continuation without a frame: {line}");
        }
    }

    let stack: Vec<String> = frames
        .into_iter()
        .map(|frame| rules.transform(frame))
        .collect();
    if !stack.iter().any(|frame| rules.is_resolved(frame)) {
        return Err(AnalysisError::UnresolvedStack);
    }

    Ok(Reason::new(component.as_str(), code, stack))
}
