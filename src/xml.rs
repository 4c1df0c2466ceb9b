//! Streaming parser for the supported BPMN subset.
//!
//! Recognizes elements by local name, so any namespace prefix (or none)
//! works. Only the first `<process>` body is read; sequence flows are kept
//! in document order, which branch selection at exclusive gateways and fork
//! emission depend on.

use std::collections::BTreeMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::EngineError;
use crate::types::{Element, SequenceFlow};

/// The element sub-tree of one `<process>` body.
#[derive(Clone, Debug)]
pub struct ParsedProcess {
    pub process_id: String,
    pub process_name: Option<String>,
    pub elements: BTreeMap<String, Element>,
    /// All sequence flows, in document order.
    pub flows: Vec<SequenceFlow>,
}

impl ParsedProcess {
    pub fn element(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    /// Outgoing flows of `source`, in document order.
    pub fn outgoing(&self, source: &str) -> Vec<&SequenceFlow> {
        self.flows
            .iter()
            .filter(|f| f.source_ref == source)
            .collect()
    }

    pub fn incoming_count(&self, target: &str) -> usize {
        self.flows.iter().filter(|f| f.target_ref == target).count()
    }
}

/// Read an attribute by local name. Empty values count as absent.
fn attr(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.into_owned())
        .filter(|v| !v.is_empty())
}

fn service_task_type(e: &BytesStart<'_>) -> Option<String> {
    attr(e, b"implementation").or_else(|| attr(e, b"type"))
}

/// Parse the first `<process>` body out of a BPMN document.
pub fn parse_process(xml: &str) -> Result<ParsedProcess, EngineError> {
    let mut reader = Reader::from_reader(xml.as_bytes());
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();

    let mut process_id: Option<String> = None;
    let mut process_name: Option<String> = None;
    let mut elements: BTreeMap<String, Element> = BTreeMap::new();
    let mut flows: Vec<SequenceFlow> = Vec::new();
    let mut in_process = false;

    // Children of the element currently being assembled.
    let mut open_flow: Option<SequenceFlow> = None;
    let mut open_script: Option<(String, Option<String>)> = None;
    let mut in_condition = false;
    let mut condition_text = String::new();
    let mut in_script = false;
    let mut script_text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let local = e.local_name();
                match local.as_ref() {
                    b"process" if process_id.is_none() => {
                        process_id = attr(&e, b"id");
                        process_name = attr(&e, b"name");
                        in_process = true;
                    }
                    _ if !in_process => {}
                    b"sequenceFlow" => {
                        open_flow = start_flow(&e);
                    }
                    b"conditionExpression" if open_flow.is_some() => {
                        in_condition = true;
                        condition_text.clear();
                    }
                    b"scriptTask" => {
                        if let Some(id) = attr(&e, b"id") {
                            open_script = Some((id, attr(&e, b"name")));
                        }
                    }
                    b"script" if open_script.is_some() => {
                        in_script = true;
                        script_text.clear();
                    }
                    other => {
                        if let Some(element) = simple_element(other, &e) {
                            elements.insert(element.id().to_string(), element);
                        }
                    }
                }
            }
            Ok(Event::Empty(e)) => {
                let local = e.local_name();
                match local.as_ref() {
                    _ if !in_process => {}
                    b"sequenceFlow" => {
                        if let Some(flow) = start_flow(&e) {
                            flows.push(flow);
                        }
                    }
                    b"scriptTask" => {
                        if let Some(id) = attr(&e, b"id") {
                            elements.insert(
                                id.clone(),
                                Element::ScriptTask {
                                    id,
                                    name: attr(&e, b"name"),
                                    script: None,
                                },
                            );
                        }
                    }
                    other => {
                        if let Some(element) = simple_element(other, &e) {
                            elements.insert(element.id().to_string(), element);
                        }
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if in_condition || in_script {
                    let text = e.unescape().unwrap_or_default();
                    if in_condition {
                        condition_text.push_str(&text);
                    } else {
                        script_text.push_str(&text);
                    }
                }
            }
            Ok(Event::CData(e)) => {
                if in_condition || in_script {
                    let text = String::from_utf8_lossy(&e).into_owned();
                    if in_condition {
                        condition_text.push_str(&text);
                    } else {
                        script_text.push_str(&text);
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"process" if in_process => break,
                b"conditionExpression" if in_condition => {
                    in_condition = false;
                    if let Some(flow) = open_flow.as_mut() {
                        let text = condition_text.trim();
                        if !text.is_empty() {
                            flow.condition = Some(text.to_string());
                        }
                    }
                }
                b"sequenceFlow" => {
                    if let Some(flow) = open_flow.take() {
                        flows.push(flow);
                    }
                }
                b"script" if in_script => {
                    in_script = false;
                }
                b"scriptTask" => {
                    if let Some((id, name)) = open_script.take() {
                        let script = script_text.trim();
                        elements.insert(
                            id.clone(),
                            Element::ScriptTask {
                                id,
                                name,
                                script: (!script.is_empty()).then(|| script.to_string()),
                            },
                        );
                        script_text.clear();
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(EngineError::InvalidDefinition(format!(
                    "malformed XML at offset {}: {e}",
                    reader.buffer_position()
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    let process_id = process_id
        .ok_or_else(|| EngineError::InvalidDefinition("no <process> with an id".to_string()))?;

    Ok(ParsedProcess {
        process_id,
        process_name,
        elements,
        flows,
    })
}

/// Build a flow from attributes; the condition child may follow.
fn start_flow(e: &BytesStart<'_>) -> Option<SequenceFlow> {
    let id = attr(e, b"id")?;
    let source_ref = attr(e, b"sourceRef")?;
    let target_ref = attr(e, b"targetRef")?;
    Some(SequenceFlow {
        id,
        source_ref,
        target_ref,
        condition: None,
    })
}

/// Elements fully described by their attributes.
fn simple_element(local: &[u8], e: &BytesStart<'_>) -> Option<Element> {
    let id = attr(e, b"id")?;
    let name = attr(e, b"name");
    match local {
        b"startEvent" => Some(Element::StartEvent { id, name }),
        b"endEvent" => Some(Element::EndEvent { id, name }),
        b"serviceTask" => Some(Element::ServiceTask {
            id,
            name,
            implementation: service_task_type(e),
        }),
        b"exclusiveGateway" => Some(Element::ExclusiveGateway {
            id,
            name,
            default_flow: attr(e, b"default"),
        }),
        b"parallelGateway" => Some(Element::ParallelGateway { id, name }),
        _ => None,
    }
}
