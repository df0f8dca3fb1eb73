//! Declarative prompt schemas
//!
//! A schema is a static list of [`FieldSpec`]s. [`collect`] walks the list and
//! asks a [`Prompter`] for each field:
//!
//! - `Scalar` fields are asked once; an empty answer leaves the field unset.
//! - `Repeated` fields are asked until an empty answer; the label lists the
//!   answers given so far.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, BufRead, Write};

/// How many values a field takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Zero or one value
    Scalar,
    /// Zero or more values
    Repeated,
}

/// One promptable field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Key the value is stored under
    pub name: &'static str,
    /// Scalar or repeated
    pub kind: FieldKind,
    /// Human readable field name used in the prompt label
    pub prompt: &'static str,
}

impl FieldSpec {
    /// Field taking at most one value
    pub const fn scalar(name: &'static str, prompt: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Scalar,
            prompt,
        }
    }

    /// Field taking any number of values
    pub const fn repeated(name: &'static str, prompt: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Repeated,
            prompt,
        }
    }
}

/// X.509 subject fields, keyed by their cert-manager names
pub static SUBJECT_SCHEMA: &[FieldSpec] = &[
    FieldSpec::repeated("organizations", "organizations"),
    FieldSpec::repeated("countries", "countries"),
    FieldSpec::repeated("organizationalUnits", "organizational units"),
    FieldSpec::repeated("localities", "localities"),
    FieldSpec::repeated("provinces", "provinces"),
    FieldSpec::repeated("streetAddresses", "street addresses"),
    FieldSpec::repeated("postalCodes", "postal codes"),
    FieldSpec::scalar("serialNumber", "serial number"),
];

/// A collected value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Answer to a scalar field
    Scalar(String),
    /// Answers to a repeated field, in order
    Repeated(Vec<String>),
}

/// Values collected for a schema. Unset fields are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldValues {
    values: BTreeMap<&'static str, FieldValue>,
}

impl FieldValues {
    /// Value of `name`, if set
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.values.get(name)
    }

    /// Value of scalar field `name`, if set
    pub fn scalar(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(FieldValue::Scalar(v)) => Some(v),
            _ => None,
        }
    }

    /// Values of repeated field `name`; empty if unset
    pub fn repeated(&self, name: &str) -> &[String] {
        match self.values.get(name) {
            Some(FieldValue::Repeated(v)) => v,
            _ => &[],
        }
    }

    /// Whether no field is set
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of set fields
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// YAML mapping of the set fields, ready to embed in a manifest
    pub fn to_yaml(&self) -> serde_yaml::Mapping {
        self.values
            .iter()
            .map(|(name, value)| {
                let value = match value {
                    FieldValue::Scalar(v) => serde_yaml::Value::String(v.clone()),
                    FieldValue::Repeated(vs) => serde_yaml::Value::Sequence(
                        vs.iter().cloned().map(serde_yaml::Value::String).collect(),
                    ),
                };
                (serde_yaml::Value::String((*name).to_string()), value)
            })
            .collect()
    }
}

/// Source of answers
pub trait Prompter {
    /// Show `label` and return the answer without its line terminator
    fn prompt(&mut self, label: &str) -> io::Result<String>;
}

/// Ask every field in `schema`
pub fn collect(schema: &[FieldSpec], prompter: &mut dyn Prompter) -> io::Result<FieldValues> {
    let mut values = FieldValues::default();

    for field in schema {
        match field.kind {
            FieldKind::Scalar => {
                let answer = prompter.prompt(&format!("Enter {}", field.prompt))?;
                let answer = answer.trim();
                if !answer.is_empty() {
                    values
                        .values
                        .insert(field.name, FieldValue::Scalar(answer.to_string()));
                }
            }
            FieldKind::Repeated => {
                let mut answers: Vec<String> = Vec::new();
                loop {
                    let label = if answers.is_empty() {
                        format!(
                            "Enter {} (optional, multiple values accepted, empty to finish)",
                            field.prompt
                        )
                    } else {
                        format!("Enter {} ({})", field.prompt, answers.join(", "))
                    };
                    let answer = prompter.prompt(&label)?;
                    let answer = answer.trim();
                    if answer.is_empty() {
                        break;
                    }
                    answers.push(answer.to_string());
                }
                if !answers.is_empty() {
                    values.values.insert(field.name, FieldValue::Repeated(answers));
                }
            }
        }
    }

    Ok(values)
}

/// Line based prompter over any reader and writer. End of input reads as an
/// empty answer.
pub struct LinePrompter<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> LinePrompter<R, W> {
    /// Read answers from `input`, write labels to `output`
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

/// Prompter on the process terminal
pub type StdinPrompter = LinePrompter<io::StdinLock<'static>, io::Stderr>;

impl StdinPrompter {
    /// Answers from stdin, labels on stderr
    pub fn stdio() -> Self {
        LinePrompter::new(io::stdin().lock(), io::stderr())
    }
}

impl<R: BufRead, W: Write> Prompter for LinePrompter<R, W> {
    fn prompt(&mut self, label: &str) -> io::Result<String> {
        write!(self.output, "{label}: ")?;
        self.output.flush()?;

        let mut line = String::new();
        self.input.read_line(&mut line)?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Prompter replaying fixed answers. Answers empty once the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: VecDeque<String>,
    labels: Vec<String>,
}

impl ScriptedPrompter {
    /// Replay `answers` in order
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            labels: Vec::new(),
        }
    }

    /// Labels shown so far, in order
    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

impl Prompter for ScriptedPrompter {
    fn prompt(&mut self, label: &str) -> io::Result<String> {
        self.labels.push(label.to_string());
        Ok(self.answers.pop_front().unwrap_or_default())
    }
}
