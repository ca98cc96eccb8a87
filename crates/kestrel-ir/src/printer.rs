// IR printer
//
// Renders a Graph as indented text:
//
//   graph(%x.0 : Tensor, %n.1 : int):
//     %2 : int = Constant[value=1]()
//     %3 : bool = gt.int(%n.1, %2)
//     %4 : Tensor = If(%3, %x.0)
//       block0(%x.5 : Tensor):
//         %6 : Tensor = relu(%x.5)
//         -> (%6)
//       block1(%x.7 : Tensor):
//         -> (%x.7)
//     return (%4)
//
// Values print as `%name.id` when they carry a debug name, `%id` otherwise,
// so every printed name is unique.

use std::fmt::{self, Write};

use crate::graph::{BlockId, Graph, NodeId, NodeKind, ValueId};

impl Graph {
    /// Printed name of a value.
    pub fn value_label(&self, v: ValueId) -> String {
        match &self.value(v).debug_name {
            Some(name) => format!("%{name}.{}", v.0),
            None => format!("%{}", v.0),
        }
    }

    fn typed_list(&self, vals: &[ValueId]) -> String {
        let parts: Vec<String> = vals
            .iter()
            .map(|&v| format!("{} : {}", self.value_label(v), self.value_type(v)))
            .collect();
        parts.join(", ")
    }

    fn plain_list(&self, vals: &[ValueId]) -> String {
        let parts: Vec<String> = vals.iter().map(|&v| self.value_label(v)).collect();
        parts.join(", ")
    }

    fn write_node(&self, out: &mut String, node: NodeId, indent: usize) -> fmt::Result {
        let n = self.node(node);
        let pad = "  ".repeat(indent);
        write!(out, "{pad}")?;
        if !n.outputs.is_empty() {
            write!(out, "{} = ", self.typed_list(&n.outputs))?;
        }
        let head = match &n.kind {
            NodeKind::Constant(c) => format!("Constant[value={c}]"),
            NodeKind::CallFunction { name } => format!("CallFunction[name=\"{name}\"]"),
            NodeKind::CallMethod { name } => format!("CallMethod[name=\"{name}\"]"),
            NodeKind::GetAttr { name } => format!("GetAttr[name=\"{name}\"]"),
            NodeKind::SetAttr { name } => format!("SetAttr[name=\"{name}\"]"),
            NodeKind::TupleIndex { index } => format!("TupleIndex[index={index}]"),
            other => other.name(),
        };
        writeln!(out, "{head}({})", self.plain_list(&n.inputs))?;
        for (i, &b) in n.blocks.iter().enumerate() {
            self.write_block(out, b, i, indent + 1)?;
        }
        Ok(())
    }

    fn write_block(&self, out: &mut String, block: BlockId, index: usize, indent: usize) -> fmt::Result {
        let b = self.block(block);
        let pad = "  ".repeat(indent);
        writeln!(out, "{pad}block{index}({}):", self.typed_list(&b.params))?;
        for &n in &b.nodes {
            self.write_node(out, n, indent + 1)?;
        }
        writeln!(out, "{pad}  -> ({})", self.plain_list(&b.returns))
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        writeln!(out, "graph({}):", self.typed_list(self.inputs()))?;
        for &n in &self.block(self.top()).nodes {
            self.write_node(&mut out, n, 1)?;
        }
        writeln!(out, "  return ({})", self.plain_list(self.outputs()))?;
        f.write_str(&out)
    }
}

#[cfg(test)]
mod tests {
    use crate::graph::{Constant, Graph, InsertPoint};
    use crate::types::Type;

    #[test]
    fn test_prints_nodes_and_outputs() {
        let mut g = Graph::new();
        let x = g.add_input(Type::tensor(), Some("x"));
        let top = g.top();
        let two = g.insert_constant(InsertPoint::End(top), Constant::Int(2));
        let n = g.insert_op(InsertPoint::End(top), "mul", &[x, two], &[]).unwrap();
        let out = g.node(n).outputs[0];
        g.set_outputs(&[out]);
        let text = g.to_string();
        assert!(text.starts_with("graph(%x.0 : Tensor):"));
        assert!(text.contains("%1 : int = Constant[value=2]()"));
        assert!(text.contains("%2 : Tensor = mul.Scalar(%x.0, %1)"));
        assert!(text.trim_end().ends_with("return (%2)"));
    }
}
