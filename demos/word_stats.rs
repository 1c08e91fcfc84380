//! Two-phase pipeline: the first phase measures a batch of words and
//! stores the lengths in a shared datastructure, the second phase reads
//! them back and prints a summary. Run with:
//!
//! ```sh
//! cargo run --example word_stats
//! ```

use std::sync::Arc;

use pipework::{
    init_logging, plot, NamePriority, Node, NodeBase, Pipeline, TerminalProgress, Token,
};

struct Generator {
    base: NodeBase,
    words: Vec<&'static str>,
    lengths: Vec<u64>,
}

impl Generator {
    fn new(words: Vec<&'static str>, dest: &Token) -> anyhow::Result<Self> {
        let mut base = NodeBase::new();
        base.set_name("measure words", NamePriority::User);
        base.set_memory_fraction(1.0)?;
        base.register_datastructure_usage("lengths", 1.0)?;
        base.add_buffered_push_destination(dest);
        Ok(Self {
            base,
            words,
            lengths: Vec::new(),
        })
    }
}

impl Node for Generator {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn propagate(&mut self) -> anyhow::Result<()> {
        self.base.set_steps(self.words.len() as u64);
        self.base.forward("n_words", self.words.len() as u64);
        Ok(())
    }

    fn go(&mut self) -> anyhow::Result<()> {
        for word in &self.words {
            self.lengths.push(word.len() as u64);
            self.base.step(1);
        }
        Ok(())
    }

    fn end(&mut self) -> anyhow::Result<()> {
        self.base
            .set_datastructure("lengths", std::mem::take(&mut self.lengths))?;
        Ok(())
    }
}

struct Summarizer {
    base: NodeBase,
}

impl Summarizer {
    fn new(token: Token) -> anyhow::Result<Self> {
        let mut base = NodeBase::with_token(token);
        base.set_name("summarize", NamePriority::User);
        base.register_datastructure_usage("lengths", 1.0)?;
        Ok(Self { base })
    }
}

impl Node for Summarizer {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn go(&mut self) -> anyhow::Result<()> {
        let lengths = self.base.get_datastructure::<Vec<u64>>("lengths")?;
        let n_words = self.base.fetch::<u64>("n_words")?;
        let total: u64 = lengths.iter().sum();

        println!(
            "{n_words} words, {total} bytes, average length {:.1}",
            total as f64 / n_words.max(1) as f64
        );
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    init_logging().ok();

    let sink = Token::new();
    let generator = Generator::new(
        vec!["out", "of", "core", "pipelines", "made", "simple"],
        &sink,
    )?;
    let summarizer = Summarizer::new(sink)?;

    let mut pipeline = Pipeline::new().with_progress(Arc::new(TerminalProgress::new()));
    pipeline.add(generator);
    pipeline.add(summarizer);

    eprintln!("{}", plot::render_dot(&pipeline));

    let report = pipeline.run(64 << 20)?;
    eprintln!("executed {} phases", report.phases.len());

    Ok(())
}
