//! In-memory property trees for per-channel stores.
//!
//! A tree mirrors one channel file: a root with named child nodes, each
//! optionally carrying a value and further children. Children keep insertion
//! order so repeated saves produce stable files.

use settled_proto::value::Value;

/// One node of a channel tree.
#[derive(Debug, Clone)]
pub struct Node {
	/// The path segment naming this node among its siblings.
	pub name: String,
	/// The node's own value; [`Value::Empty`] for pure branch nodes.
	pub value: Value,
	/// Whether a system layer declared this node (and its subtree) locked.
	pub locked: bool,
	/// Child nodes, ordered by insertion.
	pub children: Vec<Node>,
}

impl Node {
	fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			value: Value::Empty,
			locked: false,
			children: Vec::new(),
		}
	}

	fn child(&self, name: &str) -> Option<&Node> {
		self.children.iter().find(|c| c.name == name)
	}

	fn child_index(&self, name: &str) -> Option<usize> {
		self.children.iter().position(|c| c.name == name)
	}

	/// Whether this node still justifies its place in the file.
	fn is_prunable(&self) -> bool {
		self.value.is_empty() && self.children.is_empty()
	}
}

/// Splits a property path into its segments.
///
/// Accepts `""` and `"/"` as the empty (root) path.
pub fn segments(property: &str) -> impl Iterator<Item = &str> {
	property.split('/').filter(|s| !s.is_empty())
}

/// The property tree of a single channel layer.
#[derive(Debug, Clone)]
pub struct PropertyTree {
	root: Node,
}

impl Default for PropertyTree {
	fn default() -> Self {
		Self::new()
	}
}

impl PropertyTree {
	/// Creates an empty tree.
	#[must_use]
	pub fn new() -> Self {
		Self {
			root: Node::new("/"),
		}
	}

	/// Builds a tree around an already-parsed root node.
	#[must_use]
	pub fn from_root(root: Node) -> Self {
		Self { root }
	}

	/// The root node.
	#[must_use]
	pub fn root(&self) -> &Node {
		&self.root
	}

	/// True when the tree has no nodes besides the root.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.root.children.is_empty()
	}

	/// Looks up the node at `property`, if any.
	#[must_use]
	pub fn get(&self, property: &str) -> Option<&Node> {
		let mut node = &self.root;
		for seg in segments(property) {
			node = node.child(seg)?;
		}
		Some(node)
	}

	/// The value stored at `property`, when the node exists and carries one.
	#[must_use]
	pub fn value(&self, property: &str) -> Option<&Value> {
		self.get(property)
			.map(|n| &n.value)
			.filter(|v| !v.is_empty())
	}

	/// Stores `value` at `property`, creating the node chain as needed.
	pub fn set(&mut self, property: &str, value: Value) {
		let mut node = &mut self.root;
		for seg in segments(property) {
			let idx = match node.child_index(seg) {
				Some(idx) => idx,
				None => {
					node.children.push(Node::new(seg));
					node.children.len() - 1
				}
			};
			node = &mut node.children[idx];
		}
		node.value = value;
	}

	/// Removes `property` from the tree.
	///
	/// Non-recursive removal clears the node's own value and keeps any
	/// children; recursive removal drops the whole subtree. Either way,
	/// ancestors left without values or children are pruned. Returns the
	/// property paths whose values were removed.
	pub fn reset(&mut self, property: &str, recursive: bool) -> Vec<String> {
		let segs: Vec<&str> = segments(property).collect();
		if segs.is_empty() {
			// Whole-channel reset.
			let mut removed = Vec::new();
			for child in &self.root.children {
				collect_values(child, "", &mut removed);
			}
			self.root.children.clear();
			return removed.into_iter().map(|(p, _)| p).collect();
		}

		let mut removed = Vec::new();
		reset_in(&mut self.root, &segs, "", recursive, &mut removed);
		removed
	}

	/// Collects `(path, value)` for every valued node at or under `base`.
	///
	/// An empty or `/` base means the whole tree.
	#[must_use]
	pub fn collect(&self, base: &str) -> Vec<(String, Value)> {
		let mut out = Vec::new();
		let segs: Vec<&str> = segments(base).collect();

		if segs.is_empty() {
			for child in &self.root.children {
				collect_values(child, "", &mut out);
			}
			return out;
		}

		let mut node = &self.root;
		for seg in &segs {
			match node.child(seg) {
				Some(child) => node = child,
				None => return out,
			}
		}

		let prefix = format!("/{}", segs.join("/"));
		if !node.value.is_empty() {
			out.push((prefix.clone(), node.value.clone()));
		}
		for child in &node.children {
			collect_values(child, &prefix, &mut out);
		}
		out
	}

	/// Drops every node that carries neither a value nor children.
	pub fn prune(&mut self) {
		prune_node(&mut self.root);
	}

	/// Whether this layer locks `property`.
	///
	/// A layer locks a path when it carries a value there, or when any node
	/// along the path is explicitly flagged locked (which covers the whole
	/// subtree beneath it).
	#[must_use]
	pub fn locks(&self, property: &str) -> bool {
		let mut node = &self.root;
		for seg in segments(property) {
			if node.locked {
				return true;
			}
			match node.child(seg) {
				Some(child) => node = child,
				None => return false,
			}
		}
		node.locked || !node.value.is_empty()
	}
}

fn prune_node(node: &mut Node) {
	node.children.retain_mut(|child| {
		prune_node(child);
		!child.is_prunable()
	});
}

fn collect_values(node: &Node, prefix: &str, out: &mut Vec<(String, Value)>) {
	let path = format!("{prefix}/{}", node.name);
	if !node.value.is_empty() {
		out.push((path.clone(), node.value.clone()));
	}
	for child in &node.children {
		collect_values(child, &path, out);
	}
}

fn reset_in(
	node: &mut Node,
	segs: &[&str],
	prefix: &str,
	recursive: bool,
	removed: &mut Vec<String>,
) {
	let name = segs[0];
	let path = format!("{prefix}/{name}");

	if segs.len() == 1 {
		let Some(idx) = node.child_index(name) else {
			return;
		};

		if recursive {
			let mut dropped = Vec::new();
			collect_values(&node.children[idx], prefix, &mut dropped);
			removed.extend(dropped.into_iter().map(|(p, _)| p));
			node.children.remove(idx);
		} else {
			let child = &mut node.children[idx];
			if !child.value.is_empty() {
				removed.push(path);
			}
			child.value = Value::Empty;
			if child.children.is_empty() {
				node.children.remove(idx);
			}
		}
		return;
	}

	let Some(idx) = node.child_index(name) else {
		return;
	};
	reset_in(&mut node.children[idx], &segs[1..], &path, recursive, removed);
	if node.children[idx].is_prunable() {
		node.children.remove(idx);
	}
}
