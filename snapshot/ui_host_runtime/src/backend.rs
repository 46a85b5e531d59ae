use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

/// Primitive element operations the main side needs from a rendering backend.
pub trait UiBackend {
    /// Opaque handle to a real UI element. Never crosses the channel.
    type Element: Clone + PartialEq + fmt::Debug;

    fn create_element(&mut self, tag: &str) -> Result<Self::Element, String>;

    /// Inserts `child` before `before`, or appends when `before` is `None`.
    fn insert_before(
        &mut self,
        parent: &Self::Element,
        child: &Self::Element,
        before: Option<&Self::Element>,
    ) -> Result<(), String>;

    fn remove_child(&mut self, parent: &Self::Element, child: &Self::Element) -> Result<(), String>;

    /// A `Value::Null` value clears the attribute.
    fn set_attribute(
        &mut self,
        element: &Self::Element,
        key: &str,
        value: &Value,
    ) -> Result<(), String>;

    fn set_style_property(
        &mut self,
        element: &Self::Element,
        key: &str,
        value: &Value,
    ) -> Result<(), String>;

    fn append_child(
        &mut self,
        parent: &Self::Element,
        child: &Self::Element,
    ) -> Result<(), String> {
        self.insert_before(parent, child, None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElementHandle(pub usize);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryElement {
    pub tag: String,
    pub attributes: BTreeMap<String, Value>,
    pub style: BTreeMap<String, Value>,
    pub children: Vec<ElementHandle>,
    pub parent: Option<ElementHandle>,
}

/// In-memory element tree. Backs the headless host and the tests.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    elements: Vec<MemoryElement>,
    mutations: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn element(&self, handle: &ElementHandle) -> Option<&MemoryElement> {
        self.elements.get(handle.0)
    }

    pub fn attribute(&self, handle: &ElementHandle, key: &str) -> Option<&Value> {
        self.element(handle).and_then(|element| element.attributes.get(key))
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Number of mutating calls received so far.
    pub fn mutations(&self) -> usize {
        self.mutations
    }

    /// Elements that currently have no parent, in creation order.
    pub fn roots(&self) -> Vec<ElementHandle> {
        self.elements
            .iter()
            .enumerate()
            .filter(|(_, element)| element.parent.is_none())
            .map(|(index, _)| ElementHandle(index))
            .collect()
    }

    pub fn dump_tree(&self, root: Option<&ElementHandle>) -> String {
        let mut output = String::new();
        match root {
            Some(handle) => self.dump_element(&mut output, *handle, 0),
            None => output.push_str("(no root)\n"),
        }
        output
    }

    fn dump_element(&self, output: &mut String, handle: ElementHandle, depth: usize) {
        let indent = "  ".repeat(depth);
        let Some(element) = self.element(&handle) else {
            let _ = writeln!(output, "{indent}[{}] (missing)", handle.0);
            return;
        };

        let _ = write!(output, "{indent}[{}] <{}>", handle.0, element.tag);
        for (key, value) in &element.attributes {
            let _ = write!(output, " {key}={value}");
        }
        if !element.style.is_empty() {
            let style: Vec<String> = element
                .style
                .iter()
                .map(|(key, value)| format!("{key}:{value}"))
                .collect();
            let _ = write!(output, " style=[{}]", style.join(";"));
        }
        output.push('\n');

        for child in &element.children {
            self.dump_element(output, *child, depth + 1);
        }
    }

    fn element_mut(&mut self, handle: &ElementHandle) -> Result<&mut MemoryElement, String> {
        self.elements
            .get_mut(handle.0)
            .ok_or_else(|| format!("unknown element {}", handle.0))
    }

    fn detach(&mut self, child: ElementHandle) -> Result<(), String> {
        let Some(parent) = self.element_mut(&child)?.parent.take() else {
            return Ok(());
        };
        self.element_mut(&parent)?.children.retain(|existing| *existing != child);
        Ok(())
    }
}

impl UiBackend for MemoryBackend {
    type Element = ElementHandle;

    fn create_element(&mut self, tag: &str) -> Result<ElementHandle, String> {
        self.mutations += 1;
        self.elements.push(MemoryElement {
            tag: tag.to_string(),
            ..MemoryElement::default()
        });
        Ok(ElementHandle(self.elements.len() - 1))
    }

    fn insert_before(
        &mut self,
        parent: &ElementHandle,
        child: &ElementHandle,
        before: Option<&ElementHandle>,
    ) -> Result<(), String> {
        if parent == child {
            return Err(format!("cannot insert element {} into itself", child.0));
        }
        self.mutations += 1;
        self.detach(*child)?;

        let siblings = &mut self.element_mut(parent)?.children;
        let position = before
            .and_then(|before| siblings.iter().position(|existing| existing == before))
            .unwrap_or(siblings.len());
        siblings.insert(position, *child);

        self.element_mut(child)?.parent = Some(*parent);
        Ok(())
    }

    fn remove_child(
        &mut self,
        parent: &ElementHandle,
        child: &ElementHandle,
    ) -> Result<(), String> {
        if self.element_mut(child)?.parent != Some(*parent) {
            return Err(format!("element {} is not a child of {}", child.0, parent.0));
        }
        self.mutations += 1;
        self.detach(*child)
    }

    fn set_attribute(
        &mut self,
        element: &ElementHandle,
        key: &str,
        value: &Value,
    ) -> Result<(), String> {
        self.mutations += 1;
        let attributes = &mut self.element_mut(element)?.attributes;
        if value.is_null() {
            attributes.remove(key);
        } else {
            attributes.insert(key.to_string(), value.clone());
        }
        Ok(())
    }

    fn set_style_property(
        &mut self,
        element: &ElementHandle,
        key: &str,
        value: &Value,
    ) -> Result<(), String> {
        self.mutations += 1;
        let style = &mut self.element_mut(element)?.style;
        if value.is_null() {
            style.remove(key);
        } else {
            style.insert(key.to_string(), value.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_before_orders_children() {
        let mut backend = MemoryBackend::new();
        let parent = backend.create_element("view").expect("parent");
        let a = backend.create_element("text").expect("a");
        let b = backend.create_element("text").expect("b");

        backend.append_child(&parent, &a).expect("append a");
        backend.insert_before(&parent, &b, Some(&a)).expect("insert b");

        let element = backend.element(&parent).expect("parent element");
        assert_eq!(element.children, vec![b, a]);
        assert_eq!(backend.roots(), vec![parent]);
    }

    #[test]
    fn reinsert_moves_child_between_parents() {
        let mut backend = MemoryBackend::new();
        let first = backend.create_element("view").expect("first");
        let second = backend.create_element("view").expect("second");
        let child = backend.create_element("image").expect("child");

        backend.append_child(&first, &child).expect("append");
        backend.append_child(&second, &child).expect("move");

        assert!(backend.element(&first).expect("first").children.is_empty());
        assert_eq!(backend.element(&second).expect("second").children, vec![child]);
        assert_eq!(backend.element(&child).expect("child").parent, Some(second));
    }

    #[test]
    fn null_attribute_clears_key() {
        let mut backend = MemoryBackend::new();
        let element = backend.create_element("view").expect("element");
        backend
            .set_attribute(&element, "id", &json!("root"))
            .expect("set");
        backend.set_attribute(&element, "id", &Value::Null).expect("clear");
        assert!(backend.attribute(&element, "id").is_none());
    }

    #[test]
    fn removing_non_child_is_an_error() {
        let mut backend = MemoryBackend::new();
        let parent = backend.create_element("view").expect("parent");
        let child = backend.create_element("view").expect("child");
        assert!(backend.remove_child(&parent, &child).is_err());
    }

    #[test]
    fn dump_tree_renders_nested_elements() {
        let mut backend = MemoryBackend::new();
        let parent = backend.create_element("view").expect("parent");
        let child = backend.create_element("text").expect("child");
        backend.append_child(&parent, &child).expect("append");
        backend
            .set_attribute(&child, "text", &json!("hello"))
            .expect("set text");

        assert_eq!(
            backend.dump_tree(Some(&parent)),
            "[0] <view>\n  [1] <text> text=\"hello\"\n"
        );
        assert_eq!(backend.dump_tree(None), "(no root)\n");
    }
}
