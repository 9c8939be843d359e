//! Concatenates shader fragments while remembering where each generated line
//! came from, so backend errors can point back at the script.

#[derive(Debug, Clone, PartialEq, Eq)]
struct Block {
    /// First generated line of this block (1-based).
    first_line: u32,
    line_count: u32,
    /// Script line of the block's first line; `None` for synthesized code.
    origin: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct SourceAssembler {
    text: String,
    blocks: Vec<Block>,
    next_line: u32,
}

impl SourceAssembler {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            blocks: Vec::new(),
            next_line: 1,
        }
    }

    /// Append user-authored text whose first line is `origin_line` in the script.
    pub fn add_source_block(&mut self, text: &str, origin_line: u32) {
        self.push_block(text, Some(origin_line));
    }

    /// Append generated text that has no script counterpart.
    pub fn add_non_source_block(&mut self, text: &str) {
        self.push_block(text, None);
    }

    pub fn result_text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    /// Script line for a 1-based line of [`Self::result_text`].
    pub fn source_line(&self, generated_line: u32) -> Option<u32> {
        let idx = self
            .blocks
            .partition_point(|b| b.first_line + b.line_count <= generated_line);
        let block = self.blocks.get(idx)?;
        if generated_line < block.first_line {
            return None;
        }
        block
            .origin
            .map(|origin| origin + (generated_line - block.first_line))
    }

    fn push_block(&mut self, text: &str, origin: Option<u32>) {
        if text.is_empty() {
            return;
        }
        // Every block ends on a line boundary so the next one starts fresh.
        let line_count = text.lines().count().max(1) as u32;
        self.text.push_str(text);
        if !text.ends_with('\n') {
            self.text.push('\n');
        }
        self.blocks.push(Block {
            first_line: self.next_line,
            line_count,
            origin,
        });
        self.next_line += line_count;
    }
}

impl Default for SourceAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn maps_source_lines_and_hides_synthesized_ones() {
        let mut asm = SourceAssembler::new();
        asm.add_non_source_block("#version 450\n");
        asm.add_source_block("float a;\nfloat b;", 10);
        asm.add_non_source_block("void main() {\n");
        asm.add_source_block("out_color = vec4(a);\n", 20);
        asm.add_non_source_block("}\n");

        assert_eq!(
            asm.result_text(),
            "#version 450\nfloat a;\nfloat b;\nvoid main() {\nout_color = vec4(a);\n}\n"
        );
        assert_eq!(asm.source_line(1), None);
        assert_eq!(asm.source_line(2), Some(10));
        assert_eq!(asm.source_line(3), Some(11));
        assert_eq!(asm.source_line(4), None);
        assert_eq!(asm.source_line(5), Some(20));
        assert_eq!(asm.source_line(6), None);
        assert_eq!(asm.source_line(7), None);
        assert_eq!(asm.source_line(0), None);
    }

    #[test]
    fn empty_blocks_take_no_lines() {
        let mut asm = SourceAssembler::new();
        asm.add_source_block("", 5);
        asm.add_source_block("x;\n", 8);
        assert_eq!(asm.source_line(1), Some(8));
        assert_eq!(asm.result_text(), "x;\n");
    }

    fn block_strategy() -> impl Strategy<Value = (Vec<String>, Option<u32>)> {
        (
            prop::collection::vec("[a-z;=][a-z ;=]{0,11}", 1..6),
            prop::option::of(1u32..500),
        )
    }

    proptest! {
        #[test]
        fn every_generated_line_maps_back_to_its_fragment(
            blocks in prop::collection::vec(block_strategy(), 1..8)
        ) {
            let mut asm = SourceAssembler::new();
            // (generated line, expected source line, text)
            let mut expected = Vec::new();
            let mut line = 1u32;
            for (lines, origin) in &blocks {
                let text = lines.join("\n");
                match origin {
                    Some(o) => asm.add_source_block(&text, *o),
                    None => asm.add_non_source_block(&text),
                }
                for (i, l) in lines.iter().enumerate() {
                    expected.push((line, origin.map(|o| o + i as u32), l.clone()));
                    line += 1;
                }
            }

            let generated: Vec<&str> = asm.result_text().lines().collect();
            prop_assert_eq!(generated.len(), expected.len());
            for (gen_line, source_line, text) in expected {
                prop_assert_eq!(asm.source_line(gen_line), source_line);
                prop_assert_eq!(generated[(gen_line - 1) as usize], text.as_str());
            }
            prop_assert_eq!(asm.source_line(line), None);
        }
    }
}
