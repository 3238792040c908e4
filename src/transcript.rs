//! Speaker-tagged conversation transcript.

use std::fmt;

/// Who said a transcript line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    /// The person at the microphone (input transcription)
    User,
    /// The remote agent (output transcription)
    Tutor,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Tutor => "tutor",
        }
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptLine {
    pub speaker: Speaker,
    pub text: String,
}

impl fmt::Display for TranscriptLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.speaker, self.text)
    }
}

/// Append-only transcript. Lines keep arrival order across both speakers and
/// are never merged.
#[derive(Debug, Default, Clone)]
pub struct TranscriptAccumulator {
    lines: Vec<TranscriptLine>,
}

impl TranscriptAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, speaker: Speaker, text: impl Into<String>) {
        self.lines.push(TranscriptLine {
            speaker,
            text: text.into(),
        });
    }

    pub fn lines(&self) -> &[TranscriptLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The whole transcript as one string, one `speaker: text` line each.
    pub fn to_text(&self) -> String {
        self.lines
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleaved_speakers_keep_arrival_order() {
        let mut transcript = TranscriptAccumulator::new();
        transcript.append(Speaker::User, "A");
        transcript.append(Speaker::Tutor, "B");
        transcript.append(Speaker::User, "C");

        let tagged: Vec<String> = transcript
            .lines()
            .iter()
            .map(|l| format!("{}:{}", l.speaker, l.text))
            .collect();
        assert_eq!(tagged, vec!["user:A", "tutor:B", "user:C"]);
    }

    #[test]
    fn test_fragments_are_not_coalesced() {
        let mut transcript = TranscriptAccumulator::new();
        transcript.append(Speaker::Tutor, "Let's ");
        transcript.append(Speaker::Tutor, "start.");
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.to_text(), "tutor: Let's \ntutor: start.");
    }

    #[test]
    fn test_empty_transcript_renders_empty() {
        assert_eq!(TranscriptAccumulator::new().to_text(), "");
    }
}
