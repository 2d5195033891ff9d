//! The on-disk XML grammar for channel files.
//!
//! ```xml
//! <channel name="NAME" version="1.0">
//!   <property name="SEG" type="TAG" value="LITERAL" locked="true">
//!     <property .../>
//!     <value type="TAG" value="LITERAL"/>
//!   </property>
//! </channel>
//! ```
//!
//! Scalar values live in the `value` attribute; array elements are `value`
//! child elements in order and may nest. `locked="true"` is only meaningful
//! in system-layer files.

use quick_xml::Reader;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event as XmlEvent};
use settled_proto::errors::Error;
use settled_proto::value::{Value, ValueKind};

use super::tree::Node;

/// The channel file format version this build reads and writes.
const FORMAT_VERSION: &str = "1.0";

/// A parsed channel file.
#[derive(Debug)]
pub struct ParsedChannel {
	/// The channel name declared by the file.
	pub name: String,
	/// The root of the property tree.
	pub root: Node,
}

struct Attrs {
	name: Option<String>,
	kind: Option<ValueKind>,
	literal: Option<String>,
	locked: bool,
	version: Option<String>,
}

fn read_attrs(elem: &BytesStart<'_>) -> Result<Attrs, Error> {
	let mut attrs = Attrs {
		name: None,
		kind: None,
		literal: None,
		locked: false,
		version: None,
	};

	for attr in elem.attributes() {
		let attr = attr.map_err(Error::read_failure)?;
		let value = attr.unescape_value().map_err(Error::read_failure)?;
		match attr.key.as_ref() {
			b"name" => attrs.name = Some(value.into_owned()),
			b"type" => {
				attrs.kind = Some(ValueKind::from_tag(&value).ok_or_else(|| {
					Error::ReadFailure {
						message: format!("unknown value type \"{value}\""),
					}
				})?);
			}
			b"value" => attrs.literal = Some(value.into_owned()),
			b"locked" => attrs.locked = value.as_ref() == "true",
			b"version" => attrs.version = Some(value.into_owned()),
			_ => {}
		}
	}

	Ok(attrs)
}

fn scalar_from_attrs(kind: ValueKind, literal: Option<&str>) -> Result<Value, Error> {
	match kind {
		ValueKind::Empty => Ok(Value::Empty),
		ValueKind::Array => Ok(Value::Array(Vec::new())),
		_ => {
			let literal = literal.ok_or_else(|| Error::ReadFailure {
				message: format!("{} value without a value attribute", kind.as_tag()),
			})?;
			Value::from_literal(kind, literal).map_err(Error::read_failure)
		}
	}
}

enum Frame {
	Property(Node),
	ArrayValue(Vec<Value>),
	/// An explicitly closed scalar `<value ...></value>`; already attached.
	ScalarValue,
}

struct Parser {
	channel_name: Option<String>,
	root: Node,
	stack: Vec<Frame>,
}

fn fail(message: impl Into<String>, position: usize) -> Error {
	Error::ReadFailure {
		message: format!("{} (at offset {position})", message.into()),
	}
}

impl Parser {
	fn open(&mut self, elem: &BytesStart<'_>, self_closing: bool, position: usize) -> Result<(), Error> {
		let attrs = read_attrs(elem)?;

		match elem.name().as_ref() {
			b"channel" => {
				if self.channel_name.is_some() {
					return Err(fail("nested channel element", position));
				}
				self.channel_name = Some(
					attrs
						.name
						.ok_or_else(|| fail("channel element without a name", position))?,
				);
			}
			b"property" => {
				if self.channel_name.is_none() {
					return Err(fail("property outside a channel", position));
				}
				let name = attrs
					.name
					.ok_or_else(|| fail("property element without a name", position))?;
				let kind = attrs
					.kind
					.ok_or_else(|| fail(format!("property \"{name}\" without a type"), position))?;
				let node = Node {
					name,
					value: scalar_from_attrs(kind, attrs.literal.as_deref())?,
					locked: attrs.locked,
					children: Vec::new(),
				};
				if self_closing {
					attach_node(&mut self.stack, &mut self.root, node);
				} else {
					self.stack.push(Frame::Property(node));
				}
			}
			b"value" => {
				let kind = attrs
					.kind
					.ok_or_else(|| fail("value element without a type", position))?;
				if kind == ValueKind::Array && !self_closing {
					self.stack.push(Frame::ArrayValue(Vec::new()));
				} else {
					let value = scalar_from_attrs(kind, attrs.literal.as_deref())?;
					attach_value(&mut self.stack, value).map_err(|m| fail(m, position))?;
					if !self_closing {
						self.stack.push(Frame::ScalarValue);
					}
				}
			}
			other => {
				return Err(fail(
					format!("unexpected element \"{}\"", String::from_utf8_lossy(other)),
					position,
				));
			}
		}
		Ok(())
	}

	fn close(&mut self, elem: &BytesEnd<'_>, position: usize) -> Result<(), Error> {
		match elem.name().as_ref() {
			b"channel" => Ok(()),
			b"property" => match self.stack.pop() {
				Some(Frame::Property(node)) => {
					attach_node(&mut self.stack, &mut self.root, node);
					Ok(())
				}
				_ => Err(fail("mismatched property end tag", position)),
			},
			b"value" => match self.stack.pop() {
				Some(Frame::ArrayValue(items)) => attach_value(&mut self.stack, Value::Array(items))
					.map_err(|m| fail(m, position)),
				Some(Frame::ScalarValue) => Ok(()),
				_ => Err(fail("mismatched value end tag", position)),
			},
			_ => Ok(()),
		}
	}
}

/// Parses the contents of a channel file.
pub fn parse_channel(input: &str) -> Result<ParsedChannel, Error> {
	let mut reader = Reader::from_str(input);
	reader.trim_text(true);

	let mut parser = Parser {
		channel_name: None,
		root: Node {
			name: "/".into(),
			value: Value::Empty,
			locked: false,
			children: Vec::new(),
		},
		stack: Vec::new(),
	};

	loop {
		let position = reader.buffer_position();
		match reader.read_event() {
			Err(e) => return Err(Error::read_failure(e)),
			Ok(XmlEvent::Eof) => break,
			Ok(XmlEvent::Start(elem)) => parser.open(&elem, false, position)?,
			Ok(XmlEvent::Empty(elem)) => parser.open(&elem, true, position)?,
			Ok(XmlEvent::End(elem)) => parser.close(&elem, position)?,
			Ok(_) => {}
		}
	}

	let name = parser.channel_name.ok_or_else(|| Error::ReadFailure {
		message: "file contains no channel element".into(),
	})?;

	Ok(ParsedChannel {
		name,
		root: parser.root,
	})
}

fn attach_node(stack: &mut [Frame], root: &mut Node, node: Node) {
	for frame in stack.iter_mut().rev() {
		if let Frame::Property(parent) = frame {
			parent.children.push(node);
			return;
		}
	}
	root.children.push(node);
}

fn attach_value(stack: &mut [Frame], value: Value) -> Result<(), String> {
	match stack.last_mut() {
		Some(Frame::ArrayValue(items)) => {
			items.push(value);
			Ok(())
		}
		Some(Frame::Property(node)) => match &mut node.value {
			Value::Array(items) => {
				items.push(value);
				Ok(())
			}
			_ => Err(format!(
				"value element inside non-array property \"{}\"",
				node.name
			)),
		},
		Some(Frame::ScalarValue) => Err("value element inside a scalar value".into()),
		None => Err("value element outside a property".into()),
	}
}

/// Renders a channel tree to the file format.
pub fn write_channel(channel: &str, root: &Node) -> Result<Vec<u8>, Error> {
	let mut writer = quick_xml::Writer::new_with_indent(Vec::new(), b' ', 2);

	writer
		.write_event(XmlEvent::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
		.map_err(Error::write_failure)?;

	let mut channel_elem = BytesStart::new("channel");
	channel_elem.push_attribute(("name", channel));
	channel_elem.push_attribute(("version", FORMAT_VERSION));

	if root.children.is_empty() {
		writer
			.write_event(XmlEvent::Empty(channel_elem))
			.map_err(Error::write_failure)?;
	} else {
		writer
			.write_event(XmlEvent::Start(channel_elem))
			.map_err(Error::write_failure)?;
		for child in &root.children {
			write_node(&mut writer, child)?;
		}
		writer
			.write_event(XmlEvent::End(BytesEnd::new("channel")))
			.map_err(Error::write_failure)?;
	}

	let mut out = writer.into_inner();
	out.push(b'\n');
	Ok(out)
}

fn write_node(writer: &mut quick_xml::Writer<Vec<u8>>, node: &Node) -> Result<(), Error> {
	let mut elem = BytesStart::new("property");
	elem.push_attribute(("name", node.name.as_str()));
	elem.push_attribute(("type", node.value.kind().as_tag()));
	if let Some(literal) = node.value.to_literal() {
		elem.push_attribute(("value", literal.as_str()));
	}
	if node.locked {
		elem.push_attribute(("locked", "true"));
	}

	let array_items = match &node.value {
		Value::Array(items) => items.as_slice(),
		_ => &[],
	};

	if node.children.is_empty() && array_items.is_empty() {
		writer
			.write_event(XmlEvent::Empty(elem))
			.map_err(Error::write_failure)?;
		return Ok(());
	}

	writer
		.write_event(XmlEvent::Start(elem))
		.map_err(Error::write_failure)?;
	for item in array_items {
		write_value(writer, item)?;
	}
	for child in &node.children {
		write_node(writer, child)?;
	}
	writer
		.write_event(XmlEvent::End(BytesEnd::new("property")))
		.map_err(Error::write_failure)?;
	Ok(())
}

fn write_value(writer: &mut quick_xml::Writer<Vec<u8>>, value: &Value) -> Result<(), Error> {
	let mut elem = BytesStart::new("value");
	elem.push_attribute(("type", value.kind().as_tag()));
	if let Some(literal) = value.to_literal() {
		elem.push_attribute(("value", literal.as_str()));
	}

	match value {
		Value::Array(items) if !items.is_empty() => {
			writer
				.write_event(XmlEvent::Start(elem))
				.map_err(Error::write_failure)?;
			for item in items {
				write_value(writer, item)?;
			}
			writer
				.write_event(XmlEvent::End(BytesEnd::new("value")))
				.map_err(Error::write_failure)?;
		}
		_ => {
			writer
				.write_event(XmlEvent::Empty(elem))
				.map_err(Error::write_failure)?;
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::perchannel_xml::tree::PropertyTree;

	const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<channel name="test-channel" version="1.0">
  <property name="general" type="empty">
    <property name="greeting" type="string" value="hello &amp; &lt;world&gt;"/>
    <property name="count" type="int" value="-42"/>
    <property name="big" type="uint64" value="42000000000"/>
    <property name="ratio" type="double" value="42.4242"/>
    <property name="flag" type="bool" value="true" locked="true"/>
  </property>
  <property name="arr" type="array">
    <value type="bool" value="true"/>
    <value type="int64" value="5000000000"/>
    <value type="string" value="test string"/>
    <value type="array">
      <value type="uint16" value="7"/>
    </value>
  </property>
</channel>
"#;

	#[test]
	fn parses_scalars_and_arrays() {
		let parsed = parse_channel(SAMPLE).unwrap();
		assert_eq!(parsed.name, "test-channel");

		let tree = PropertyTree::from_root(parsed.root);
		assert_eq!(
			tree.value("/general/greeting"),
			Some(&Value::String("hello & <world>".into()))
		);
		assert_eq!(tree.value("/general/count"), Some(&Value::Int(-42)));
		assert_eq!(
			tree.value("/general/big"),
			Some(&Value::Uint64(42_000_000_000))
		);
		assert_eq!(tree.value("/general/ratio"), Some(&Value::Double(42.4242)));
		assert_eq!(tree.value("/general/flag"), Some(&Value::Bool(true)));
		assert_eq!(
			tree.value("/arr"),
			Some(&Value::Array(vec![
				Value::Bool(true),
				Value::Int64(5_000_000_000),
				Value::String("test string".into()),
				Value::Array(vec![Value::Uint16(7)]),
			]))
		);

		// Branch nodes carry no value but do exist.
		assert!(tree.get("/general").is_some());
		assert_eq!(tree.value("/general"), None);

		// locked is parsed from the file.
		assert!(tree.get("/general/flag").is_some_and(|n| n.locked));
		assert!(tree.get("/general/count").is_some_and(|n| !n.locked));
	}

	#[test]
	fn write_then_parse_round_trips() {
		let parsed = parse_channel(SAMPLE).unwrap();
		let bytes = write_channel("test-channel", &parsed.root).unwrap();
		let rendered = String::from_utf8(bytes).unwrap();

		let reparsed = parse_channel(&rendered).unwrap();
		assert_eq!(reparsed.name, "test-channel");

		let before = PropertyTree::from_root(parsed.root);
		let after = PropertyTree::from_root(reparsed.root);
		assert_eq!(before.collect("/"), after.collect("/"));
	}

	#[test]
	fn empty_channel_renders_self_closed() {
		let tree = PropertyTree::new();
		let bytes = write_channel("empty", tree.root()).unwrap();
		let rendered = String::from_utf8(bytes).unwrap();
		assert!(rendered.contains("<channel name=\"empty\" version=\"1.0\"/>"));
	}

	#[test]
	fn unknown_type_is_a_read_failure() {
		let doc = r#"<channel name="c" version="1.0">
  <property name="x" type="float" value="1"/>
</channel>"#;
		let err = parse_channel(doc).unwrap_err();
		assert!(matches!(err, Error::ReadFailure { .. }));
	}

	#[test]
	fn scalar_without_literal_is_a_read_failure() {
		let doc = r#"<channel name="c" version="1.0">
  <property name="x" type="int"/>
</channel>"#;
		assert!(parse_channel(doc).is_err());
	}

	#[test]
	fn missing_channel_element_is_a_read_failure() {
		assert!(parse_channel("<?xml version=\"1.0\"?>").is_err());
	}
}
