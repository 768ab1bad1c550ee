//! Fixed parts of the generated translation unit.
//!
//! Symbol names here are consumed by the embedded build that links the
//! generated file; renaming any of them breaks it.

use std::fmt::Write;

use time::macros::format_description;
use time::OffsetDateTime;

use crate::core::{CompileResult, ARENA_SYMBOL, CONST_SYMBOL};

/// Bytes per line in byte array initializers.
const BYTES_PER_LINE: usize = 16;

const PROLOGUE: &str = r#"
#include <string.h>

#include "tensorflow/lite/c/common.h"
#include "tensorflow/lite/micro/kernels/micro_ops.h"

#ifdef _DEBUG
#include <stdio.h>
#define DBGPRINTF(format, ...) printf(format, ##__VA_ARGS__)
#else
#define DBGPRINTF(format, ...)
#endif

namespace {
"#;

const CONTEXT_SETUP: &str = r#"void Setup() {
  g_ctx.impl_ = nullptr;
  g_ctx.ReportError = nullptr;
  g_ctx.recommended_num_threads = 1;
  g_ctx.AllocatePersistentBuffer = &AllocatePersistentBuffer;
  g_ctx.RequestScratchBufferInArena = &RequestScratchBufferInArena;
  g_ctx.GetScratchBuffer = &GetScratchBuffer;

"#;

/// Variable parts of the generated program.
#[derive(Debug)]
pub struct ProgramParts<'a> {
    pub timestamp: Option<String>,
    pub model_data: &'a [u8],
    pub arena_size: usize,
    pub registrations: usize,
    pub nodes: usize,
    pub tensors: usize,
    pub quants: usize,
    pub int_array_bytes: usize,
    pub float_array_bytes: usize,
    pub persistent_buffers: usize,
    /// Persistent buffers requested during init; prepare starts after them.
    pub init_buffers: usize,
    pub scratch_buffers: usize,
    pub setup: String,
    pub eval: String,
    pub input_tensor: Option<usize>,
    pub output_tensor: Option<usize>,
}

/// Comment line with the current UTC time, `DD.MM.YYYY HH:MM:SS`.
pub fn timestamp_line() -> Option<String> {
    let format = format_description!("[day].[month].[year] [hour]:[minute]:[second]");
    match OffsetDateTime::now_utc().format(&format) {
        Ok(now) => Some(format!("// Generated on: {now}\n")),
        Err(err) => {
            log::warn!("could not format generation timestamp: {err}");
            None
        }
    }
}

/// Brace-enclosed `0x..` initializer list holding exactly `data`.
pub fn byte_array(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 6 + data.len() / BYTES_PER_LINE * 3 + 4);
    out.push('{');
    for (line, chunk) in data.chunks(BYTES_PER_LINE).enumerate() {
        if line > 0 {
            out.push(',');
        }
        out.push_str("\n  ");
        let bytes: Vec<String> = chunk.iter().map(|byte| format!("0x{byte:02x}")).collect();
        out.push_str(&bytes.join(", "));
    }
    out.push_str("\n}");
    out
}

/// C++ `float` literal that reads back as exactly `value`.
pub fn float_literal(value: f32) -> String {
    if value.is_nan() {
        return "__builtin_nanf(\"\")".to_string();
    }
    if value.is_infinite() {
        let sign = if value < 0.0 { "-" } else { "" };
        return format!("{sign}__builtin_inff()");
    }
    format!("{value:?}f")
}

/// Assemble the translation unit.
pub fn render(parts: &ProgramParts<'_>) -> CompileResult<String> {
    let mut out = String::new();
    out.push_str("// This file is generated. Do not edit.\n");
    if let Some(line) = &parts.timestamp {
        out.push_str(line);
    }
    out.push_str(PROLOGUE);

    writeln!(
        out,
        "const unsigned char {CONST_SYMBOL}[] __attribute__((aligned(16))) = {};",
        byte_array(parts.model_data)
    )?;
    writeln!(out, "const int {CONST_SYMBOL}_len = {};", parts.model_data.len())?;
    writeln!(out)?;
    writeln!(out, "constexpr int kTensorArenaSize = {};", parts.arena_size)?;
    writeln!(out, "uint8_t {ARENA_SYMBOL}[kTensorArenaSize] __attribute__((aligned(16)));")?;
    writeln!(out)?;
    writeln!(out, "TfLiteRegistration *g_regOp[{}];", parts.registrations)?;
    writeln!(out, "TfLiteNode g_node[{}];", parts.nodes)?;
    writeln!(out, "TfLiteTensor g_tensors[{}];", parts.tensors)?;
    if parts.quants > 0 {
        writeln!(out, "TfLiteAffineQuantization g_quants[{}];", parts.quants)?;
        writeln!(
            out,
            "char g_intArrayBuf[{}] __attribute__((aligned(4)));",
            parts.int_array_bytes
        )?;
        writeln!(
            out,
            "char g_floatArrayBuf[{}] __attribute__((aligned(4)));",
            parts.float_array_bytes
        )?;
    }
    if parts.persistent_buffers > 0 {
        writeln!(out, "void *g_persistentBuf[{}];", parts.persistent_buffers)?;
    }
    if parts.scratch_buffers > 0 {
        writeln!(out, "void *g_scratchBuf[{}];", parts.scratch_buffers)?;
    }
    out.push_str("int g_persistentBufNext = 0;\n");
    out.push_str("int g_scratchBufNext = 0;\n");
    out.push_str("TfLiteContext g_ctx{};\n\n");

    write_callbacks(&mut out, parts)?;
    out.push_str("} // namespace\n\n");

    out.push_str(CONTEXT_SETUP);
    out.push_str(&parts.setup);
    out.push_str("}\n\n");

    write_pointer_getter(&mut out, "void *GetInputPtr()", parts.input_tensor)?;
    write_pointer_getter(&mut out, "const void *GetOutputPtr()", parts.output_tensor)?;

    out.push_str("void Eval()\n{\n");
    writeln!(out, "  g_persistentBufNext = {};", parts.init_buffers)?;
    out.push_str("  g_scratchBufNext = 0;\n");
    out.push_str(&parts.eval);
    out.push_str("}\n");
    Ok(out)
}

fn write_callbacks(out: &mut String, parts: &ProgramParts<'_>) -> CompileResult<()> {
    out.push_str(
        "TfLiteStatus AllocatePersistentBuffer(TfLiteContext *ctx, size_t bytes, \
         void **ptr) {\n",
    );
    if parts.persistent_buffers > 0 {
        writeln!(out, "  if (g_persistentBufNext >= {}) {{", parts.persistent_buffers)?;
        out.push_str("    return kTfLiteError;\n  }\n");
        out.push_str("  *ptr = g_persistentBuf[g_persistentBufNext++];\n");
        out.push_str("  return kTfLiteOk;\n");
    } else {
        out.push_str("  return kTfLiteError;\n");
    }
    out.push_str("}\n\n");

    out.push_str(
        "TfLiteStatus RequestScratchBufferInArena(TfLiteContext *ctx, size_t bytes, \
         int *buffer_idx) {\n",
    );
    if parts.scratch_buffers > 0 {
        writeln!(out, "  if (g_scratchBufNext >= {}) {{", parts.scratch_buffers)?;
        out.push_str("    return kTfLiteError;\n  }\n");
        out.push_str("  *buffer_idx = g_scratchBufNext++;\n");
        out.push_str("  return kTfLiteOk;\n");
    } else {
        out.push_str("  return kTfLiteError;\n");
    }
    out.push_str("}\n\n");

    out.push_str("void *GetScratchBuffer(TfLiteContext *ctx, int buffer_idx) {\n");
    if parts.scratch_buffers > 0 {
        out.push_str("  return g_scratchBuf[buffer_idx];\n");
    } else {
        out.push_str("  return nullptr;\n");
    }
    out.push_str("}\n");
    Ok(())
}

fn write_pointer_getter(
    out: &mut String,
    signature: &str,
    tensor: Option<usize>,
) -> CompileResult<()> {
    writeln!(out, "{signature}\n{{")?;
    match tensor {
        Some(index) => writeln!(out, "  return g_ctx.tensors[{index}].data.data;")?,
        None => out.push_str("  return nullptr;\n"),
    }
    out.push_str("}\n\n");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_array() {
        assert_eq!(byte_array(&[0x54, 0x00, 0xff]), "{\n  0x54, 0x00, 0xff\n}");
        let long = byte_array(&[7u8; 40]);
        assert_eq!(long.matches('\n').count(), 4);
        assert_eq!(long.matches("0x07").count(), 40);
        assert!(long.contains("0x07,\n  0x07"));
        // No terminator is appended.
        assert!(!long.contains('"'));
    }

    #[test]
    fn test_float_literal() {
        assert_eq!(float_literal(0.5), "0.5f");
        assert_eq!(float_literal(3.0), "3.0f");
        assert_eq!(float_literal(f32::NEG_INFINITY), "-__builtin_inff()");
        assert_eq!(float_literal(0.003921569), "0.003921569f");
    }

    #[test]
    fn test_timestamp_format() {
        let line = timestamp_line().unwrap();
        assert!(line.starts_with("// Generated on: "));
        let stamp = line.trim_end().trim_start_matches("// Generated on: ");
        // DD.MM.YYYY HH:MM:SS
        assert_eq!(stamp.len(), 19);
        assert_eq!(&stamp[2..3], ".");
        assert_eq!(&stamp[10..11], " ");
    }
}
