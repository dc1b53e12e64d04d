//! División del texto extraído en trozos de tamaño fijo con solapamiento.
//!
//! Las unidades son caracteres (no bytes), así que los cortes nunca caen en
//! medio de un carácter UTF-8. Los límites no respetan frases ni párrafos:
//! el solapamiento existe para compensar los cortes arbitrarios.

use anyhow::{anyhow, Result};

use crate::models::Chunk;

/// Tamaño y solapamiento de los chunks, ya validados.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self { chunk_size: 500, chunk_overlap: 50 }
    }
}

impl ChunkerConfig {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 || chunk_overlap == 0 {
            return Err(anyhow!("chunk_size y chunk_overlap deben ser positivos"));
        }
        if chunk_overlap >= chunk_size {
            return Err(anyhow!(
                "chunk_overlap ({chunk_overlap}) debe ser menor que chunk_size ({chunk_size})"
            ));
        }
        Ok(Self { chunk_size, chunk_overlap })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// Avance entre el inicio de dos chunks consecutivos.
    pub fn step(&self) -> usize {
        self.chunk_size - self.chunk_overlap
    }

    /// Número de chunks que produce un texto de `len` caracteres.
    pub fn expected_chunks(&self, len: usize) -> usize {
        if len == 0 {
            0
        } else if len <= self.chunk_size {
            1
        } else {
            1 + (len - self.chunk_size).div_ceil(self.step())
        }
    }
}

/// Trocea `text` y devuelve un iterador que se consume una sola vez.
pub fn chunk<'a>(text: &'a str, source: &str, config: ChunkerConfig) -> Chunks<'a> {
    // Frontera en bytes de cada carácter, más el final del texto.
    let mut boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    boundaries.push(text.len());

    Chunks {
        text,
        source: source.to_string(),
        boundaries,
        config,
        next_start: 0,
        index: 0,
        done: text.is_empty(),
    }
}

/// Secuencia ordenada y finita de chunks de un texto.
#[derive(Debug)]
pub struct Chunks<'a> {
    text: &'a str,
    source: String,
    boundaries: Vec<usize>,
    config: ChunkerConfig,
    next_start: usize,
    index: usize,
    done: bool,
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.done {
            return None;
        }

        let char_len = self.boundaries.len() - 1;
        let start = self.next_start;
        let end = (start + self.config.chunk_size).min(char_len);

        let chunk = Chunk {
            index: self.index,
            offset: start,
            text: self.text[self.boundaries[start]..self.boundaries[end]].to_string(),
            source: self.source.clone(),
        };

        if end == char_len {
            self.done = true;
        } else {
            self.next_start = start + self.config.step();
            self.index += 1;
        }

        Some(chunk)
    }
}
