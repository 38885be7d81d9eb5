use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const SYSTEM_PROMPT: &str = "You are a JSON generator. Respond with VALID JSON ONLY.\n\
Do NOT include backticks, comments, HTML tags, markdown, or any extra text.";

pub const MISSING_CHOICES_MESSAGE: &str = "LLM response missing choices";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Recipe {
    pub recipe_name: String,
    pub ingredients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Event {
    pub event_name: String,
    pub event_date: String,
    pub participants: Vec<String>,
}

/// The closed set of structured output kinds the service can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StructuredKind {
    Recipe,
    Event,
}

impl StructuredKind {
    pub const ALL: [StructuredKind; 2] = [StructuredKind::Recipe, StructuredKind::Event];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            StructuredKind::Recipe => "recipe",
            StructuredKind::Event => "event",
        }
    }

    pub fn instruction(self) -> &'static str {
        match self {
            StructuredKind::Recipe => "You should give the requested recipe and ingredients.",
            StructuredKind::Event => {
                "You should extract the event name, date, and the names of the people involved."
            }
        }
    }

    fn schema(self) -> Value {
        match self {
            StructuredKind::Recipe => schemars::schema_for!(Recipe).to_value(),
            StructuredKind::Event => schemars::schema_for!(Event).to_value(),
        }
    }

    /// Parses `text` as JSON and checks it against this kind's shape,
    /// returning the normalised object.
    pub fn validate(self, text: &str) -> Result<Value, String> {
        let parsed: Value = serde_json::from_str(text).map_err(|err| err.to_string())?;
        match self {
            StructuredKind::Recipe => conform::<Recipe>(parsed),
            StructuredKind::Event => conform::<Event>(parsed),
        }
    }
}

fn conform<T>(value: Value) -> Result<Value, String>
where
    T: DeserializeOwned + Serialize,
{
    let typed: T = serde_json::from_value(value).map_err(|err| err.to_string())?;
    serde_json::to_value(typed).map_err(|err| err.to_string())
}

#[derive(Debug, Clone)]
pub struct StructuredType {
    pub kind: StructuredKind,
    pub schema: Value,
}

impl StructuredType {
    /// The synthetic leading system message for this kind.
    pub fn system_message(&self) -> String {
        format!("{SYSTEM_PROMPT}\n{}", self.kind.instruction())
    }
}

/// Schemas are generated once at startup and never change afterwards.
#[derive(Debug, Clone)]
pub struct StructuredRegistry {
    types: Vec<StructuredType>,
}

impl StructuredRegistry {
    pub fn new() -> Self {
        let types = StructuredKind::ALL
            .into_iter()
            .map(|kind| StructuredType {
                kind,
                schema: kind.schema(),
            })
            .collect();
        Self { types }
    }

    pub fn lookup(&self, name: &str) -> Option<&StructuredType> {
        let kind = StructuredKind::from_name(name)?;
        self.types.iter().find(|t| t.kind == kind)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.types.iter().map(|t| t.kind.name()).collect()
    }
}

impl Default for StructuredRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One entry of the structured endpoint's output list.
pub fn choice_outcome(kind: StructuredKind, text: Option<&str>) -> Result<Value, Value> {
    let Some(text) = text else {
        return Err(json!({
            "error": "Invalid structured JSON: choice has no message content",
            "raw_output": Value::Null,
        }));
    };
    kind.validate(text).map_err(|detail| {
        json!({
            "error": format!("Invalid structured JSON: {detail}"),
            "raw_output": text,
        })
    })
}

pub fn missing_choices_record(raw: &Value) -> Value {
    json!({
        "error": MISSING_CHOICES_MESSAGE,
        "raw": raw,
    })
}
