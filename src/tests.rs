//! # Tests Module
//!
//! Unit and integration tests for the whole pipeline: lexer, parser,
//! semantic passes, tuple lowering, and the AVM, plus the partitioner
//! properties and the IR round trip. Most tests drive full programs
//! through [`crate::invoke`] with injected input and output streams.

#[cfg(test)]
mod tests {
    use crate::builtins::{index_of, match_locate, split_into, substitute, substr, FieldSep};
    use crate::compiler;
    use crate::error::{AwkError, ErrorKind};
    use crate::ext::{Extension, ExtensionContext, ExtensionRegistry};
    use crate::lexer::Lexer;
    use crate::opcode::TupleList;
    use crate::parser::Parser;
    use crate::partitioner::Partitioner;
    use crate::semantic;
    use crate::settings::{ScriptSource, Settings};
    use crate::token::TokenKind;
    use crate::value::{strtod, Value};

    use regex::Regex;
    use std::cell::RefCell;
    use std::io::{Cursor, Read, Write};
    use std::rc::Rc;

    // =========================================================================
    // HELPERS — Run AWK source through the full pipeline
    // =========================================================================

    /// A writable buffer the test keeps a handle to after `invoke`
    /// consumes the other.
    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.borrow()).into_owned()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn base_settings(program: &str, input: &str) -> (Settings, SharedBuf) {
        let mut settings = Settings::new();
        settings
            .script_sources
            .push(ScriptSource::from_text(ScriptSource::COMMAND_LINE, program));
        settings.input = Some(Box::new(Cursor::new(input.as_bytes().to_vec())));
        let buf = SharedBuf::default();
        settings.output = Some(Box::new(buf.clone()));
        (settings, buf)
    }

    /// Runs a program over the given input, returning captured stdout.
    fn run_awk(program: &str, input: &str) -> Result<String, AwkError> {
        let (settings, buf) = base_settings(program, input);
        crate::invoke(settings)?;
        Ok(buf.contents())
    }

    /// Runs a program and returns (exit code, stdout).
    fn run_awk_status(program: &str, input: &str) -> Result<(i32, String), AwkError> {
        let (settings, buf) = base_settings(program, input);
        let code = crate::invoke(settings)?;
        Ok((code, buf.contents()))
    }

    /// Tokenizes source and returns the token kinds (excluding Eof).
    fn tokenize(source: &str) -> Result<Vec<TokenKind>, AwkError> {
        let mut lexer = Lexer::new(source);
        Ok(lexer
            .tokenize()?
            .into_iter()
            .map(|t| t.kind)
            .filter(|k| !matches!(k, TokenKind::Eof))
            .collect())
    }

    /// Runs source and expects a specific error kind from some stage.
    fn expect_error(program: &str, input: &str, kind: ErrorKind) {
        match run_awk(program, input) {
            Ok(out) => panic!("expected {:?} error, got output {:?}", kind, out),
            Err(e) => assert_eq!(e.kind, kind, "expected {:?}, got: {}", kind, e),
        }
    }

    /// Lowers a program to tuples without running it.
    fn lower(program: &str) -> TupleList {
        let tokens = Lexer::new(program).tokenize().expect("lexes");
        let mut ast = Parser::new(tokens).parse().expect("parses");
        let table = semantic::analyze(&mut ast).expect("analyzes");
        compiler::compile(&ast, &table, &Settings::new()).expect("lowers")
    }

    fn temp_path(label: &str) -> String {
        let dir = std::env::temp_dir();
        dir.join(format!("hawk-test-{}-{}", label, std::process::id()))
            .to_string_lossy()
            .into_owned()
    }

    // =========================================================================
    // LEXER TESTS — string escapes
    // =========================================================================

    #[test]
    fn escape_backslash() {
        assert_eq!(run_awk(r#"BEGIN { printf "\\" }"#, "").unwrap(), "\\");
    }

    #[test]
    fn escape_alert() {
        assert_eq!(run_awk(r#"BEGIN { printf "\a" }"#, "").unwrap(), "\u{07}");
    }

    #[test]
    fn escape_backspace() {
        assert_eq!(run_awk(r#"BEGIN { printf "\b" }"#, "").unwrap(), "\u{08}");
    }

    #[test]
    fn escape_formfeed() {
        assert_eq!(run_awk(r#"BEGIN { printf "\f" }"#, "").unwrap(), "\u{0C}");
    }

    #[test]
    fn escape_newline() {
        assert_eq!(run_awk(r#"BEGIN { printf "\n" }"#, "").unwrap(), "\n");
    }

    #[test]
    fn escape_carriage_return() {
        assert_eq!(run_awk(r#"BEGIN { printf "\r" }"#, "").unwrap(), "\r");
    }

    #[test]
    fn escape_tab() {
        assert_eq!(run_awk(r#"BEGIN { printf "\t" }"#, "").unwrap(), "\t");
    }

    #[test]
    fn escape_vertical_tab() {
        assert_eq!(run_awk(r#"BEGIN { printf "\v" }"#, "").unwrap(), "\u{0B}");
    }

    #[test]
    fn escape_quote() {
        assert_eq!(run_awk(r#"BEGIN { printf "\"" }"#, "").unwrap(), "\"");
    }

    #[test]
    fn escape_octal_two_digits() {
        assert_eq!(run_awk(r#"BEGIN { printf "\33" }"#, "").unwrap(), "\u{1B}");
    }

    #[test]
    fn escape_octal_stops_at_non_octal() {
        assert_eq!(run_awk(r#"BEGIN { printf "\1!" }"#, "").unwrap(), "\u{01}!");
        assert_eq!(run_awk(r#"BEGIN { printf "\19" }"#, "").unwrap(), "\u{01}9");
        assert_eq!(run_awk(r#"BEGIN { printf "\38" }"#, "").unwrap(), "\u{03}8");
    }

    #[test]
    fn escape_octal_three_digit_limit() {
        assert_eq!(run_awk(r#"BEGIN { printf "\132" }"#, "").unwrap(), "Z");
        assert_eq!(run_awk(r#"BEGIN { printf "\1320" }"#, "").unwrap(), "Z0");
    }

    #[test]
    fn escape_hex() {
        assert_eq!(run_awk(r#"BEGIN { printf "\x1B" }"#, "").unwrap(), "\u{1B}");
        assert_eq!(run_awk(r#"BEGIN { printf "\x1b" }"#, "").unwrap(), "\u{1B}");
    }

    #[test]
    fn escape_hex_stops_at_non_hex() {
        assert_eq!(run_awk(r#"BEGIN { printf "\x1!" }"#, "").unwrap(), "\u{01}!");
        assert_eq!(run_awk(r#"BEGIN { printf "\x1G" }"#, "").unwrap(), "\u{01}G");
    }

    #[test]
    fn escape_hex_two_digit_limit() {
        assert_eq!(run_awk(r#"BEGIN { printf "\x21A" }"#, "").unwrap(), "!A");
    }

    #[test]
    fn escape_bare_hex_prefix_is_literal_x() {
        assert_eq!(run_awk(r#"BEGIN { printf "\x!" }"#, "").unwrap(), "x!");
    }

    #[test]
    fn escape_unknown_keeps_backslash() {
        assert_eq!(run_awk(r#"BEGIN { printf "\q" }"#, "").unwrap(), "\\q");
    }

    #[test]
    fn escape_slash_in_string_keeps_backslash() {
        // `\/` only collapses inside ERE literals, not string literals.
        assert_eq!(run_awk(r#"BEGIN { printf "a\/b" }"#, "").unwrap(), "a\\/b");
    }

    // =========================================================================
    // LEXER TESTS — failure cases
    // =========================================================================

    #[test]
    fn unfinished_string_at_eof_fails() {
        expect_error(r#"BEGIN { printf "unfinished"#, "", ErrorKind::Lexer);
    }

    #[test]
    fn unfinished_string_at_eol_fails() {
        expect_error("BEGIN { printf \"unfinished\n\"}", "", ErrorKind::Lexer);
    }

    #[test]
    fn octal_escape_cut_by_eof_fails() {
        expect_error("BEGIN { printf \"foo\\0", "", ErrorKind::Lexer);
    }

    #[test]
    fn octal_escape_cut_by_eol_fails() {
        expect_error("BEGIN { printf \"foo\\0\n\"}", "", ErrorKind::Lexer);
    }

    #[test]
    fn hex_escape_cut_by_eof_fails() {
        expect_error("BEGIN { printf \"foo\\xF", "", ErrorKind::Lexer);
    }

    #[test]
    fn hex_escape_cut_by_eol_fails() {
        expect_error("BEGIN { printf \"foo\\xf\n\"}", "", ErrorKind::Lexer);
    }

    #[test]
    fn unterminated_regex_fails() {
        expect_error("BEGIN { if ($0 ~ /abc) print }", "", ErrorKind::Lexer);
    }

    // =========================================================================
    // LEXER TESTS — tokens
    // =========================================================================

    #[test]
    fn lexer_integer_and_double_literals() {
        assert_eq!(tokenize("42").unwrap(), vec![TokenKind::Int(42)]);
        assert_eq!(tokenize("3.25").unwrap(), vec![TokenKind::Double(3.25)]);
        assert_eq!(tokenize("1e3").unwrap(), vec![TokenKind::Double(1000.0)]);
        assert_eq!(tokenize(".5").unwrap(), vec![TokenKind::Double(0.5)]);
    }

    #[test]
    fn lexer_slash_is_division_after_expression() {
        let kinds = tokenize("a / b").unwrap();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Ident("a".to_string()),
                TokenKind::Slash,
                TokenKind::Ident("b".to_string()),
            ]
        );
    }

    #[test]
    fn lexer_slash_is_regex_after_operator() {
        let kinds = tokenize("x ~ /ab/").unwrap();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Ident("x".to_string()),
                TokenKind::Tilde,
                TokenKind::Ere("ab".to_string()),
            ]
        );
    }

    #[test]
    fn lexer_regex_escaped_slash() {
        let kinds = tokenize(r"$0 ~ /a\/b/").unwrap();
        assert!(kinds.contains(&TokenKind::Ere("a/b".to_string())));
    }

    #[test]
    fn lexer_newline_suppressed_after_continuations() {
        // no Newline token between the operator and the operand
        assert!(!tokenize("a &&\nb").unwrap().contains(&TokenKind::Newline));
        assert!(!tokenize("a ||\nb").unwrap().contains(&TokenKind::Newline));
        assert!(!tokenize("f(a,\nb)").unwrap().contains(&TokenKind::Newline));
        assert!(tokenize("a\nb").unwrap().contains(&TokenKind::Newline));
    }

    #[test]
    fn lexer_funcname_requires_adjacent_paren() {
        let kinds = tokenize("foo(1)").unwrap();
        assert_eq!(kinds[0], TokenKind::FuncName("foo".to_string()));
        let kinds = tokenize("foo (1)").unwrap();
        assert_eq!(kinds[0], TokenKind::Ident("foo".to_string()));
    }

    #[test]
    fn lexer_comments_run_to_end_of_line() {
        let kinds = tokenize("a # comment ; { } /\nb").unwrap();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Ident("a".to_string()),
                TokenKind::Newline,
                TokenKind::Ident("b".to_string()),
            ]
        );
    }

    #[test]
    fn lexer_line_continuation() {
        assert!(!tokenize("a \\\nb").unwrap().contains(&TokenKind::Newline));
    }

    // =========================================================================
    // PARSER TESTS — newline continuation rules
    // =========================================================================

    #[test]
    fn newline_allowed_after_or() {
        let program = "BEGIN { if (0 || \n 1) printf \"ok\" }";
        assert_eq!(run_awk(program, "").unwrap(), "ok");
    }

    #[test]
    fn newline_allowed_after_and() {
        let program = "BEGIN { if (1 && \n 1) printf \"ok\" }";
        assert_eq!(run_awk(program, "").unwrap(), "ok");
    }

    #[test]
    fn newline_allowed_after_question_and_colon() {
        assert_eq!(
            run_awk("BEGIN { printf 1 ?\n\"ok\" : \"no\" }", "").unwrap(),
            "ok"
        );
        assert_eq!(
            run_awk("BEGIN { printf 1 ? \"ok\" :\n\"no\" }", "").unwrap(),
            "ok"
        );
    }

    #[test]
    fn newline_allowed_after_comma() {
        assert_eq!(
            run_awk("BEGIN { printf(\"%s\", \n\"ok\") }", "").unwrap(),
            "ok"
        );
    }

    #[test]
    fn newline_allowed_after_do() {
        assert_eq!(
            run_awk("BEGIN { do\n printf \"ok\"; while (0) }", "").unwrap(),
            "ok"
        );
    }

    #[test]
    fn newline_allowed_after_else() {
        let program = "BEGIN { if (0) { printf \"no\" } else \n printf \"ok\" }";
        assert_eq!(run_awk(program, "").unwrap(), "ok");
    }

    #[test]
    fn else_on_next_line() {
        let program = "BEGIN { if (0) { printf \"no\" }\nelse printf \"ok\" }";
        assert_eq!(run_awk(program, "").unwrap(), "ok");
    }

    #[test]
    fn unary_plus_coerces_to_number() {
        assert_eq!(run_awk("BEGIN { printf +a }", "").unwrap(), "0");
    }

    #[test]
    fn ternary_allows_concatenation() {
        let program = r#"BEGIN { printf( a "1" b ? "o" "k" : "no" ) }"#;
        assert_eq!(run_awk(program, "").unwrap(), "ok");
    }

    #[test]
    fn printf_without_arguments_is_a_parse_error() {
        expect_error("BEGIN { printf }", "", ErrorKind::Parser);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        expect_error("BEGIN { 1 + }", "", ErrorKind::Parser);
    }

    // =========================================================================
    // RECORDS AND FIELDS
    // =========================================================================

    #[test]
    fn nr_and_fields() {
        let out = run_awk("{ print NR, $1 }", "a\nb\nc\n").unwrap();
        assert_eq!(out, "1 a\n2 b\n3 c\n");
    }

    #[test]
    fn comma_field_separator() {
        let out = run_awk("BEGIN{FS=\",\"} {print $2}", "x,y,z\n").unwrap();
        assert_eq!(out, "y\n");
    }

    #[test]
    fn default_fs_skips_blank_runs() {
        let out = run_awk("{ print $2 }", "  a \t b  c\n").unwrap();
        assert_eq!(out, "b\n");
    }

    #[test]
    fn field_beyond_nf_is_empty() {
        let out = run_awk("{ print \"[\" $9 \"]\" }", "a b\n").unwrap();
        assert_eq!(out, "[]\n");
    }

    #[test]
    fn assigning_record_resplits() {
        let out = run_awk("{ $0 = \"p q r\"; print $2, NF }", "x\n").unwrap();
        assert_eq!(out, "q 3\n");
    }

    #[test]
    fn assigning_field_rebuilds_record() {
        let out = run_awk("{ $2 = \"Q\"; print }", "a b c\n").unwrap();
        assert_eq!(out, "a Q c\n");
    }

    #[test]
    fn assigning_field_beyond_nf_pads() {
        let out = run_awk("{ $5 = \"x\"; print NF; print }", "a b\n").unwrap();
        assert_eq!(out, "5\na b   x\n");
    }

    #[test]
    fn assigning_nf_truncates() {
        let out = run_awk("{ NF = 2; print }", "a b c d\n").unwrap();
        assert_eq!(out, "a b\n");
    }

    #[test]
    fn ofs_used_when_rebuilding() {
        let out = run_awk("BEGIN{OFS=\"-\"} { $1 = $1; print }", "a b c\n").unwrap();
        assert_eq!(out, "a-b-c\n");
    }

    #[test]
    fn pattern_only_rule_prints_record() {
        let out = run_awk("/b/", "a\nb\nab\n").unwrap();
        assert_eq!(out, "b\nab\n");
    }

    #[test]
    fn print_bare_prints_record() {
        let out = run_awk("{ print }", "one two\n").unwrap();
        assert_eq!(out, "one two\n");
    }

    #[test]
    fn nf_variable() {
        let out = run_awk("{ print NF }", "a b c\n\nx\n").unwrap();
        assert_eq!(out, "3\n0\n1\n");
    }

    // =========================================================================
    // EXPRESSIONS AND VALUES
    // =========================================================================

    #[test]
    fn integer_arithmetic_stays_exact() {
        assert_eq!(run_awk("BEGIN { print 6/2 }", "").unwrap(), "3\n");
        assert_eq!(run_awk("BEGIN { print 7/2 }", "").unwrap(), "3.5\n");
        assert_eq!(run_awk("BEGIN { print 2^10 }", "").unwrap(), "1024\n");
        assert_eq!(run_awk("BEGIN { print 7 % 3 }", "").unwrap(), "1\n");
    }

    #[test]
    fn integer_division_by_zero_fails() {
        expect_error("BEGIN { print 1/0 }", "", ErrorKind::Runtime);
        expect_error("BEGIN { print 1 % 0 }", "", ErrorKind::Runtime);
    }

    #[test]
    fn double_division_by_zero_is_infinite() {
        assert_eq!(run_awk("BEGIN { print 1.5/0 }", "").unwrap(), "inf\n");
    }

    #[test]
    fn unary_minus_before_power() {
        assert_eq!(run_awk("BEGIN { print -2^2 }", "").unwrap(), "-4\n");
    }

    #[test]
    fn power_is_right_associative() {
        assert_eq!(run_awk("BEGIN { print 2^3^2 }", "").unwrap(), "512\n");
    }

    #[test]
    fn concatenation() {
        assert_eq!(run_awk("BEGIN { print 1 \" \" 2 }", "").unwrap(), "1 2\n");
        assert_eq!(run_awk("BEGIN { print 1+2 \"x\" }", "").unwrap(), "3x\n");
    }

    #[test]
    fn comparison_string_vs_numeric() {
        // both numeric strings: numeric comparison
        assert_eq!(run_awk("{ print ($1 < $2) }", "9 10\n").unwrap(), "1\n");
        // plain string constants compare as strings
        assert_eq!(
            run_awk("BEGIN { print (\"9\" < \"10\") }", "").unwrap(),
            "0\n"
        );
        // a computed number against a numeric string is numeric
        assert_eq!(run_awk("{ print ($1 == 10) }", "10\n").unwrap(), "1\n");
    }

    #[test]
    fn uninitialized_compares_both_ways() {
        assert_eq!(run_awk("BEGIN { print (x == \"\") }", "").unwrap(), "1\n");
        assert_eq!(run_awk("BEGIN { print (x == 0) }", "").unwrap(), "1\n");
    }

    #[test]
    fn ternary_and_logical_results() {
        assert_eq!(run_awk("BEGIN { print 2 > 1 ? \"a\" : \"b\" }", "").unwrap(), "a\n");
        assert_eq!(run_awk("BEGIN { print (1 && 0), (1 || 0), !1 }", "").unwrap(), "0 1 0\n");
    }

    #[test]
    fn logical_operators_short_circuit() {
        let program = "function boom() { exit 9 } BEGIN { x = 0 && boom(); print \"ok\" }";
        assert_eq!(run_awk(program, "").unwrap(), "ok\n");
    }

    #[test]
    fn increment_and_decrement() {
        let program = "BEGIN { x = 5; print x++, x, ++x, x--, --x }";
        assert_eq!(run_awk(program, "").unwrap(), "5 6 7 7 5\n");
    }

    #[test]
    fn increment_on_array_element_and_field() {
        assert_eq!(
            run_awk("BEGIN { a[\"k\"]++; a[\"k\"]++; print a[\"k\"] }", "").unwrap(),
            "2\n"
        );
        assert_eq!(run_awk("{ $1++; print }", "41 x\n").unwrap(), "42 x\n");
    }

    #[test]
    fn compound_assignments() {
        let program = "BEGIN { x = 10; x += 2; x -= 1; x *= 3; x /= 11; x ^= 2; print x }";
        assert_eq!(run_awk(program, "").unwrap(), "9\n");
    }

    #[test]
    fn assignment_is_an_expression() {
        assert_eq!(run_awk("BEGIN { print x = y = 3 }", "").unwrap(), "3\n");
    }

    #[test]
    fn regex_match_operators() {
        assert_eq!(run_awk("BEGIN { print (\"foo\" ~ /o+/) }", "").unwrap(), "1\n");
        assert_eq!(run_awk("BEGIN { print (\"foo\" !~ /x/) }", "").unwrap(), "1\n");
    }

    #[test]
    fn bare_regex_matches_record() {
        let out = run_awk("{ if (/b/) print \"hit\" }", "abc\nxyz\n").unwrap();
        assert_eq!(out, "hit\n");
    }

    #[test]
    fn dynamic_regex_from_string() {
        assert_eq!(
            run_awk("BEGIN { pat = \"^a\"; print (\"abc\" ~ pat) }", "").unwrap(),
            "1\n"
        );
    }

    #[test]
    fn invalid_dynamic_regex_fails_at_runtime() {
        expect_error("BEGIN { print (\"x\" ~ \"(\") }", "", ErrorKind::Runtime);
    }

    #[test]
    fn numeric_conversion_is_lenient() {
        assert_eq!(run_awk("BEGIN { print \"3x\" + 1 }", "").unwrap(), "4\n");
        assert_eq!(run_awk("BEGIN { print \" 2.5z\" * 2 }", "").unwrap(), "5\n");
        assert_eq!(run_awk("BEGIN { print \"abc\" + 0 }", "").unwrap(), "0\n");
    }

    #[test]
    fn value_coercion_idempotence() {
        // to_str(to_number(s)) == s for canonical number strings
        for s in ["0", "1", "-7", "42", "3.5", "0.125", "-2.75"] {
            let n = strtod(s);
            let v = Value::from_f64(n);
            assert_eq!(v.to_str("%.6g").unwrap().as_ref(), s, "round trip of {}", s);
        }
        // to_number(to_str(n)) == n for finite numbers
        for n in [0.0, 1.0, -1.5, 1024.0, 0.0625] {
            let s = Value::Double(n).to_str("%.6g").unwrap();
            assert_eq!(strtod(&s), n, "round trip of {}", n);
        }
    }

    // =========================================================================
    // CONTROL FLOW
    // =========================================================================

    #[test]
    fn while_loop() {
        let out = run_awk("BEGIN { i = 0; while (i < 3) { print i; i++ } }", "").unwrap();
        assert_eq!(out, "0\n1\n2\n");
    }

    #[test]
    fn do_while_runs_at_least_once() {
        let out = run_awk("BEGIN { do print \"x\"; while (0) }", "").unwrap();
        assert_eq!(out, "x\n");
    }

    #[test]
    fn for_loop() {
        let out = run_awk("BEGIN { for (i = 0; i < 3; i++) print i }", "").unwrap();
        assert_eq!(out, "0\n1\n2\n");
    }

    #[test]
    fn break_and_continue() {
        let program = "BEGIN { for (i = 0; i < 10; i++) { if (i == 1) continue; if (i == 3) break; print i } }";
        assert_eq!(run_awk(program, "").unwrap(), "0\n2\n");
    }

    #[test]
    fn break_outside_loop_is_semantic_error() {
        expect_error("BEGIN { break }", "", ErrorKind::Semantic);
    }

    #[test]
    fn next_skips_remaining_rules() {
        let out = run_awk("{ if (NR == 1) next } { print }", "a\nb\n").unwrap();
        assert_eq!(out, "b\n");
    }

    #[test]
    fn next_in_begin_is_rejected() {
        expect_error("BEGIN { next }", "", ErrorKind::Semantic);
    }

    #[test]
    fn exit_in_begin_still_runs_end() {
        let (code, out) = run_awk_status("BEGIN { exit 3 } END { print \"end\" }", "").unwrap();
        assert_eq!(code, 3);
        assert_eq!(out, "end\n");
    }

    #[test]
    fn exit_in_end_is_immediate() {
        let (code, out) =
            run_awk_status("END { print \"once\"; exit 7; print \"never\" }", "x\n").unwrap();
        assert_eq!(code, 7);
        assert_eq!(out, "once\n");
    }

    #[test]
    fn exit_in_rule_skips_other_records() {
        let (code, out) =
            run_awk_status("{ print; exit } END { print \"end\" }", "a\nb\n").unwrap();
        assert_eq!(code, 0);
        assert_eq!(out, "a\nend\n");
    }

    #[test]
    fn begin_runs_once_before_input() {
        let out = run_awk("BEGIN { print \"begin\" } { print $1 }", "x\ny\n").unwrap();
        assert_eq!(out, "begin\nx\ny\n");
    }

    #[test]
    fn rules_fire_in_source_order() {
        let out = run_awk("{ print \"first\" } { print \"second\" }", "r\n").unwrap();
        assert_eq!(out, "first\nsecond\n");
    }

    #[test]
    fn range_pattern() {
        let out = run_awk("/b/,/d/", "a\nb\nc\nd\ne\n").unwrap();
        assert_eq!(out, "b\nc\nd\n");
    }

    #[test]
    fn range_pattern_single_record() {
        // start and end may match the same record
        let out = run_awk("/x/,/x/", "a\nx\nb\n").unwrap();
        assert_eq!(out, "x\n");
    }

    #[test]
    fn end_sees_final_nr() {
        let out = run_awk("END { print NR }", "a\nb\nc\n").unwrap();
        assert_eq!(out, "3\n");
    }

    // =========================================================================
    // ARRAYS
    // =========================================================================

    #[test]
    fn associative_counting() {
        let out = run_awk(
            "{a[$1]++} END {for(k in a) print k, a[k]}",
            "x\nx\ny\n",
        )
        .unwrap();
        let mut lines: Vec<&str> = out.lines().collect();
        lines.sort_unstable();
        assert_eq!(lines, vec!["x 2", "y 1"]);
    }

    #[test]
    fn for_in_insertion_order_by_default() {
        let out = run_awk(
            "BEGIN { a[\"c\"]=1; a[\"a\"]=2; a[\"b\"]=3; for (k in a) printf \"%s\", k }",
            "",
        )
        .unwrap();
        assert_eq!(out, "cab");
    }

    #[test]
    fn for_in_sorted_with_setting() {
        let mut settings = Settings::new();
        settings.use_sorted_array_keys = true;
        settings.script_sources.push(ScriptSource::from_text(
            ScriptSource::COMMAND_LINE,
            "BEGIN { a[\"c\"]=1; a[\"a\"]=2; a[\"b\"]=3; for (k in a) printf \"%s\", k }",
        ));
        settings.input = Some(Box::new(Cursor::new(Vec::new())));
        let buf = SharedBuf::default();
        settings.output = Some(Box::new(buf.clone()));
        crate::invoke(settings).unwrap();
        assert_eq!(buf.contents(), "abc");
    }

    #[test]
    fn membership_does_not_create() {
        let program =
            "BEGIN { if (\"k\" in a) print \"yes\"; else print \"no\"; print length(a) }";
        assert_eq!(run_awk(program, "").unwrap(), "no\n0\n");
    }

    #[test]
    fn reference_creates_element() {
        let program = "BEGIN { x = a[\"k\"]; print length(a) }";
        assert_eq!(run_awk(program, "").unwrap(), "1\n");
    }

    #[test]
    fn delete_element_and_array() {
        let program = "BEGIN { a[1]=1; a[2]=2; delete a[1]; print length(a); delete a; print length(a) }";
        assert_eq!(run_awk(program, "").unwrap(), "1\n0\n");
    }

    #[test]
    fn multi_subscript_uses_subsep() {
        let program = "BEGIN { a[1,2] = \"x\"; if ((1,2) in a) print \"in\"; for (k in a) n = k; print (n == 1 SUBSEP 2) }";
        assert_eq!(run_awk(program, "").unwrap(), "in\n1\n");
    }

    #[test]
    fn subsep_is_configurable() {
        let program = "BEGIN { SUBSEP = \":\"; a[1,2] = 5; print a[\"1:2\"] }";
        assert_eq!(run_awk(program, "").unwrap(), "5\n");
    }

    #[test]
    fn break_inside_for_in() {
        let program = "BEGIN { a[1]=1; a[2]=2; a[3]=3; n = 0; for (k in a) { n++; if (n == 2) break }; print n }";
        assert_eq!(run_awk(program, "").unwrap(), "2\n");
    }

    #[test]
    fn array_in_scalar_context_fails() {
        expect_error("BEGIN { a[1] = 1; print a }", "", ErrorKind::Runtime);
    }

    #[test]
    fn scalar_in_array_context_fails() {
        expect_error("BEGIN { x = 1; x[1] = 2 }", "", ErrorKind::Runtime);
    }

    // =========================================================================
    // FUNCTIONS
    // =========================================================================

    #[test]
    fn function_call_and_return() {
        let program = "function add(a, b) { return a + b } BEGIN { print add(2, 3) }";
        assert_eq!(run_awk(program, "").unwrap(), "5\n");
    }

    #[test]
    fn function_recursion() {
        let program =
            "function fact(n) { return n <= 1 ? 1 : n * fact(n - 1) } BEGIN { print fact(6) }";
        assert_eq!(run_awk(program, "").unwrap(), "720\n");
    }

    #[test]
    fn forward_reference_resolves() {
        let program = "BEGIN { print later(4) } function later(x) { return x * 2 }";
        assert_eq!(run_awk(program, "").unwrap(), "8\n");
    }

    #[test]
    fn surplus_formals_are_locals() {
        let program = "function f(a,   i) { i = a * 2; return i } BEGIN { i = 99; f(1); print i }";
        assert_eq!(run_awk(program, "").unwrap(), "99\n");
    }

    #[test]
    fn scalar_arguments_copy() {
        let program = "function f(x) { x = 0; return x } BEGIN { y = 5; f(y); print y }";
        assert_eq!(run_awk(program, "").unwrap(), "5\n");
    }

    #[test]
    fn array_arguments_pass_by_reference() {
        let program =
            "function fill(arr) { arr[\"k\"] = 7 } BEGIN { fill(a); print a[\"k\"] }";
        assert_eq!(run_awk(program, "").unwrap(), "7\n");
    }

    #[test]
    fn array_reference_through_call_chain() {
        let program = "function outer(x) { inner(x) } function inner(y) { y[1] = 3 } BEGIN { outer(a); print a[1] }";
        assert_eq!(run_awk(program, "").unwrap(), "3\n");
    }

    #[test]
    fn missing_return_value_is_uninitialized() {
        let program = "function f() { } BEGIN { x = f(); print (x == \"\"), (x == 0) }";
        assert_eq!(run_awk(program, "").unwrap(), "1 1\n");
    }

    #[test]
    fn undefined_function_is_semantic_error() {
        expect_error("BEGIN { nosuch(1) }", "", ErrorKind::Semantic);
    }

    #[test]
    fn duplicate_function_is_semantic_error() {
        expect_error(
            "function f() { return 1 } function f() { return 2 } BEGIN { f() }",
            "",
            ErrorKind::Semantic,
        );
    }

    #[test]
    fn parameter_used_both_ways_is_semantic_error() {
        expect_error(
            "function f(a) { a[1] = 1; return a + 1 } BEGIN { f(x) }",
            "",
            ErrorKind::Semantic,
        );
    }

    #[test]
    fn too_many_arguments_is_semantic_error() {
        expect_error(
            "function f(a) { return a } BEGIN { f(1, 2) }",
            "",
            ErrorKind::Semantic,
        );
    }

    #[test]
    fn deep_recursion_overflows_cleanly() {
        expect_error(
            "function f(n) { return f(n + 1) } BEGIN { f(0) }",
            "",
            ErrorKind::Runtime,
        );
    }

    // =========================================================================
    // BUILTINS
    // =========================================================================

    #[test]
    fn builtin_length() {
        assert_eq!(run_awk("BEGIN { print length(\"hello\") }", "").unwrap(), "5\n");
        assert_eq!(run_awk("{ print length }", "abcd\n").unwrap(), "4\n");
        assert_eq!(
            run_awk("BEGIN { a[1]=1; a[2]=2; print length(a) }", "").unwrap(),
            "2\n"
        );
    }

    #[test]
    fn builtin_substr() {
        assert_eq!(
            run_awk("BEGIN { print substr(\"hello\", 2, 3) }", "").unwrap(),
            "ell\n"
        );
        assert_eq!(
            run_awk("BEGIN { print substr(\"hello\", 0, 2) }", "").unwrap(),
            "h\n"
        );
        assert_eq!(
            run_awk("BEGIN { print substr(\"hello\", 3) }", "").unwrap(),
            "llo\n"
        );
    }

    #[test]
    fn builtin_index() {
        assert_eq!(
            run_awk("BEGIN { print index(\"hello\", \"llo\") }", "").unwrap(),
            "3\n"
        );
        assert_eq!(run_awk("BEGIN { print index(\"hi\", \"z\") }", "").unwrap(), "0\n");
    }

    #[test]
    fn builtin_split() {
        let program = "BEGIN { n = split(\"a:b:c\", parts, \":\"); print n, parts[1], parts[3] }";
        assert_eq!(run_awk(program, "").unwrap(), "3 a c\n");
    }

    #[test]
    fn builtin_split_uses_fs_by_default() {
        let program = "BEGIN { FS = \",\"; n = split(\"p,q\", parts); print n, parts[2] }";
        assert_eq!(run_awk(program, "").unwrap(), "2 q\n");
    }

    #[test]
    fn builtin_split_clears_previous_contents() {
        let program =
            "BEGIN { parts[99] = \"old\"; split(\"a b\", parts); print (99 in parts), parts[1] }";
        assert_eq!(run_awk(program, "").unwrap(), "0 a\n");
    }

    #[test]
    fn builtin_sub_and_gsub() {
        assert_eq!(
            run_awk("BEGIN { s = \"foo\"; n = sub(/o/, \"0\", s); print n, s }", "").unwrap(),
            "1 f0o\n"
        );
        assert_eq!(
            run_awk("BEGIN { s = \"foo\"; n = gsub(/o/, \"0\", s); print n, s }", "").unwrap(),
            "2 f00\n"
        );
    }

    #[test]
    fn gsub_on_record_by_default() {
        let out = run_awk("{ gsub(/o/, \"0\"); print }", "foo boo\n").unwrap();
        assert_eq!(out, "f00 b00\n");
    }

    #[test]
    fn sub_replacement_ampersand() {
        assert_eq!(
            run_awk(
                "BEGIN { s = \"hello\"; gsub(/l+/, \"<&>\", s); print s }",
                ""
            )
            .unwrap(),
            "he<ll>o\n"
        );
        assert_eq!(
            run_awk(
                "BEGIN { s = \"hello\"; gsub(/l+/, \"<\\\\&>\", s); print s }",
                ""
            )
            .unwrap(),
            "he<&>o\n"
        );
    }

    #[test]
    fn builtin_match_sets_rstart_rlength() {
        let program = "BEGIN { r = match(\"hello\", /l+/); print r, RSTART, RLENGTH }";
        assert_eq!(run_awk(program, "").unwrap(), "3 3 2\n");
        let program = "BEGIN { r = match(\"hello\", /z/); print r, RSTART, RLENGTH }";
        assert_eq!(run_awk(program, "").unwrap(), "0 0 -1\n");
    }

    #[test]
    fn builtin_case_mapping() {
        assert_eq!(
            run_awk("BEGIN { print toupper(\"MiXeD\"), tolower(\"MiXeD\") }", "").unwrap(),
            "MIXED mixed\n"
        );
    }

    #[test]
    fn builtin_math() {
        assert_eq!(run_awk("BEGIN { print int(3.9), int(-3.9) }", "").unwrap(), "3 -3\n");
        assert_eq!(run_awk("BEGIN { print sqrt(16) }", "").unwrap(), "4\n");
        assert_eq!(run_awk("BEGIN { print exp(0), log(1) }", "").unwrap(), "1 0\n");
        assert_eq!(run_awk("BEGIN { print sin(0), cos(0) }", "").unwrap(), "0 1\n");
        assert_eq!(run_awk("BEGIN { print atan2(0, 1) }", "").unwrap(), "0\n");
    }

    #[test]
    fn builtin_rand_is_deterministic_per_seed() {
        let program =
            "BEGIN { srand(42); x = rand(); srand(42); y = rand(); print (x == y), (x >= 0 && x < 1) }";
        assert_eq!(run_awk(program, "").unwrap(), "1 1\n");
    }

    #[test]
    fn builtin_srand_returns_previous_seed() {
        let program = "BEGIN { srand(5); p = srand(7); print p }";
        assert_eq!(run_awk(program, "").unwrap(), "5\n");
    }

    #[test]
    fn builtin_sprintf() {
        let program = "BEGIN { print sprintf(\"%03d-%s\", 7, \"x\") }";
        assert_eq!(run_awk(program, "").unwrap(), "007-x\n");
    }

    #[test]
    fn close_of_unopened_stream_returns_minus_one() {
        assert_eq!(
            run_awk("BEGIN { print close(\"/no/such/stream\") }", "").unwrap(),
            "-1\n"
        );
    }

    #[test]
    fn cast_builtins_require_flag() {
        let mut settings = Settings::new();
        settings.additional_type_functions = true;
        settings.script_sources.push(ScriptSource::from_text(
            ScriptSource::COMMAND_LINE,
            "BEGIN { print _INTEGER(\"3.7\"), _DOUBLE(\"2\") + 0.5, _STRING(4) \"x\" }",
        ));
        settings.input = Some(Box::new(Cursor::new(Vec::new())));
        let buf = SharedBuf::default();
        settings.output = Some(Box::new(buf.clone()));
        crate::invoke(settings).unwrap();
        assert_eq!(buf.contents(), "3 2.5 4x\n");

        // Without the flag the same names are plain identifiers.
        let out = run_awk("BEGIN { print _INTEGER }", "").unwrap();
        assert_eq!(out, "\n");
    }

    // =========================================================================
    // BUILTIN HELPER FUNCTIONS
    // =========================================================================

    #[test]
    fn substr_clamps_before_start() {
        assert_eq!(substr("hello", 0.0, Some(2.0)), "h");
        assert_eq!(substr("hello", -1.0, Some(3.0)), "h");
        assert_eq!(substr("hello", 2.0, Some(3.0)), "ell");
        assert_eq!(substr("hello", 2.0, None), "ello");
        assert_eq!(substr("hello", 9.0, Some(2.0)), "");
        assert_eq!(substr("hello", 3.0, Some(0.0)), "");
    }

    #[test]
    fn index_is_one_based() {
        assert_eq!(index_of("hello", "llo"), 3);
        assert_eq!(index_of("hello", "x"), 0);
        assert_eq!(index_of("hello", ""), 1);
    }

    #[test]
    fn whitespace_split_skips_leading_blanks() {
        let sep = FieldSep::Whitespace;
        assert_eq!(split_into("  a\t b  ", &sep), vec!["a", "b"]);
        assert!(split_into("   ", &sep).is_empty());
    }

    #[test]
    fn char_split_keeps_empty_fields() {
        let sep = FieldSep::Char(',');
        assert_eq!(split_into("x,,z", &sep), vec!["x", "", "z"]);
    }

    #[test]
    fn ere_split() {
        let sep = FieldSep::Ere(Regex::new("[0-9]+").unwrap());
        assert_eq!(split_into("a12b345c", &sep), vec!["a", "b", "c"]);
    }

    #[test]
    fn match_reports_positions() {
        let re = Regex::new("l+").unwrap();
        assert_eq!(match_locate("hello", &re), (3, 2));
        assert_eq!(match_locate("hey", &re), (0, -1));
    }

    #[test]
    fn sub_replaces_first_only() {
        let re = Regex::new("o").unwrap();
        let (s, n) = substitute(&re, "0", "foo", false);
        assert_eq!((s.as_str(), n), ("f0o", 1));
    }

    #[test]
    fn gsub_replaces_all_and_counts() {
        let re = Regex::new("o").unwrap();
        let (s, n) = substitute(&re, "0", "foo", true);
        assert_eq!((s.as_str(), n), ("f00", 2));
    }

    #[test]
    fn replacement_ampersand_expands_match() {
        let re = Regex::new("l+").unwrap();
        let (s, _) = substitute(&re, "<&>", "hello", true);
        assert_eq!(s, "he<ll>o");
        let (s, _) = substitute(&re, r"<\&>", "hello", true);
        assert_eq!(s, "he<&>o");
    }

    // =========================================================================
    // PRINTF FORMATTING
    // =========================================================================

    #[test]
    fn printf_integer_conversions() {
        assert_eq!(run_awk("BEGIN { printf \"%d\", 42 }", "").unwrap(), "42");
        assert_eq!(run_awk("BEGIN { printf \"%i\", -3 }", "").unwrap(), "-3");
        assert_eq!(run_awk("BEGIN { printf \"%d\", 3.9 }", "").unwrap(), "3");
        assert_eq!(run_awk("BEGIN { printf \"%x/%X/%o/%u\", 255, 255, 8, 9 }", "").unwrap(), "ff/FF/10/9");
    }

    #[test]
    fn printf_width_and_flags() {
        assert_eq!(run_awk("BEGIN { printf \"[%5d]\", 42 }", "").unwrap(), "[   42]");
        assert_eq!(run_awk("BEGIN { printf \"[%-5d]\", 42 }", "").unwrap(), "[42   ]");
        assert_eq!(run_awk("BEGIN { printf \"[%05d]\", 42 }", "").unwrap(), "[00042]");
        assert_eq!(run_awk("BEGIN { printf \"[%+d]\", 42 }", "").unwrap(), "[+42]");
    }

    #[test]
    fn printf_string_precision() {
        assert_eq!(run_awk("BEGIN { printf \"[%.2s]\", \"hello\" }", "").unwrap(), "[he]");
        assert_eq!(run_awk("BEGIN { printf \"[%6s]\", \"abc\" }", "").unwrap(), "[   abc]");
        assert_eq!(run_awk("BEGIN { printf \"[%-6s]\", \"abc\" }", "").unwrap(), "[abc   ]");
    }

    #[test]
    fn printf_float_conversions() {
        assert_eq!(run_awk("BEGIN { printf \"%f\", 1.5 }", "").unwrap(), "1.500000");
        assert_eq!(run_awk("BEGIN { printf \"%.2f\", 3.14159 }", "").unwrap(), "3.14");
        assert_eq!(run_awk("BEGIN { printf \"%e\", 150 }", "").unwrap(), "1.500000e+02");
        assert_eq!(run_awk("BEGIN { printf \"%E\", 0.015 }", "").unwrap(), "1.500000E-02");
        assert_eq!(run_awk("BEGIN { printf \"%g\", 0.5 }", "").unwrap(), "0.5");
        assert_eq!(run_awk("BEGIN { printf \"%g\", 1000000 }", "").unwrap(), "1e+06");
    }

    #[test]
    fn printf_char_conversion() {
        assert_eq!(run_awk("BEGIN { printf \"%c\", 65 }", "").unwrap(), "A");
        assert_eq!(run_awk("BEGIN { printf \"%c\", \"xyz\" }", "").unwrap(), "x");
    }

    #[test]
    fn printf_star_width() {
        assert_eq!(run_awk("BEGIN { printf \"[%*d]\", 5, 7 }", "").unwrap(), "[    7]");
        assert_eq!(run_awk("BEGIN { printf \"[%.*f]\", 1, 2.345 }", "").unwrap(), "[2.3]");
    }

    #[test]
    fn printf_percent_literal() {
        assert_eq!(run_awk("BEGIN { printf \"100%%\" }", "").unwrap(), "100%");
    }

    #[test]
    fn printf_bad_specifier_is_suppressed_by_default() {
        assert_eq!(run_awk("BEGIN { printf \"a%qb\" }", "").unwrap(), "a%qb");
    }

    #[test]
    fn printf_bad_specifier_fails_when_strict() {
        let mut settings = Settings::new();
        settings.catch_illegal_format_exceptions = false;
        settings.script_sources.push(ScriptSource::from_text(
            ScriptSource::COMMAND_LINE,
            "BEGIN { printf \"a%qb\" }",
        ));
        settings.input = Some(Box::new(Cursor::new(Vec::new())));
        settings.output = Some(Box::new(SharedBuf::default()));
        let err = crate::invoke(settings).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Format);
    }

    #[test]
    fn printf_missing_argument_is_suppressed_by_default() {
        assert_eq!(run_awk("BEGIN { printf \"x%dy\" }", "").unwrap(), "x%dy");
    }

    #[test]
    fn printf_uninitialized_argument_is_zero() {
        assert_eq!(run_awk("BEGIN { printf \"%d\", z }", "").unwrap(), "0");
    }

    #[test]
    fn print_uses_ofs_and_ors() {
        let program = "BEGIN { OFS = \"-\"; ORS = \"!\"; print \"a\", \"b\" }";
        assert_eq!(run_awk(program, "").unwrap(), "a-b!");
    }

    #[test]
    fn convfmt_governs_concatenation() {
        let program = "BEGIN { CONVFMT = \"%.2g\"; x = 0.123456; print (x \"\") }";
        assert_eq!(run_awk(program, "").unwrap(), "0.12\n");
    }

    #[test]
    fn ofmt_governs_print() {
        let program = "BEGIN { OFMT = \"%.2f\"; print 3.14159 }";
        assert_eq!(run_awk(program, "").unwrap(), "3.14\n");
    }

    // =========================================================================
    // RECORD SEPARATORS
    // =========================================================================

    #[test]
    fn custom_rs_single_char() {
        let out = run_awk("BEGIN { RS = \",\" } { print NR, $0 }", "a,b,c").unwrap();
        assert_eq!(out, "1 a\n2 b\n3 c\n");
    }

    #[test]
    fn regex_rs_splits_records() {
        let out = run_awk("BEGIN { RS = \"ab*c\" } { print $0 }", "XabcYabbcZ").unwrap();
        assert_eq!(out, "X\nY\nZ\n");
    }

    #[test]
    fn empty_rs_consumes_remaining_input() {
        let out = run_awk("BEGIN { RS = \"\" } { print NR }", "a\n\nb\nc\n").unwrap();
        assert_eq!(out, "1\n");
    }

    #[test]
    fn rs_change_mid_stream() {
        let out = run_awk(
            "NR == 1 { RS = \";\" } { print $0 }",
            "first\nsecond;third",
        )
        .unwrap();
        assert_eq!(out, "first\nsecond\nthird\n");
    }

    // =========================================================================
    // PARTITIONER
    // =========================================================================

    fn partitioner(input: &str, rs: &str) -> Partitioner {
        Partitioner::new(Box::new(Cursor::new(input.to_string())), rs, false, false)
            .expect("separator compiles")
    }

    fn collect_records(mut p: Partitioner) -> Vec<String> {
        let mut records = Vec::new();
        while let Some(r) = p.next_record().expect("read succeeds") {
            records.push(r);
        }
        records
    }

    /// Yields one byte per read so separator matches land on buffer
    /// boundaries.
    struct OneByte(Cursor<Vec<u8>>);

    impl Read for OneByte {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = 1.min(buf.len());
            self.0.read(&mut buf[..n])
        }
    }

    #[test]
    fn partitioner_newline_records() {
        let records = collect_records(partitioner("a\nb\nc\n", "\n"));
        assert_eq!(records, vec!["a", "b", "c"]);
    }

    #[test]
    fn partitioner_final_record_without_trailing_separator() {
        let records = collect_records(partitioner("a\nb", "\n"));
        assert_eq!(records, vec!["a", "b"]);
    }

    #[test]
    fn partitioner_empty_input_has_no_records() {
        let records = collect_records(partitioner("", "\n"));
        assert!(records.is_empty());
    }

    #[test]
    fn partitioner_regex_separator() {
        let records = collect_records(partitioner("XabcYabbcZ", "ab*c"));
        assert_eq!(records, vec!["X", "Y", "Z"]);
    }

    #[test]
    fn partitioner_empty_rs_consumes_everything() {
        let records = collect_records(partitioner("a\n\nb\nc\n", ""));
        assert_eq!(records, vec!["a\n\nb\nc\n"]);
    }

    #[test]
    fn partitioner_separator_change_takes_effect() {
        let mut p = partitioner("a,b;c", ",");
        assert_eq!(p.next_record().unwrap().as_deref(), Some("a"));
        p.set_record_separator(";").unwrap();
        assert_eq!(p.next_record().unwrap().as_deref(), Some("b"));
        assert_eq!(p.next_record().unwrap().as_deref(), Some("c"));
        assert_eq!(p.next_record().unwrap(), None);
    }

    #[test]
    fn partitioner_partition_law_reconstructs_input() {
        // Records plus matched separators must reconstruct the input.
        let input = "one::two:::three";
        let records = collect_records(partitioner(input, ":+"));
        assert_eq!(records, vec!["one", "two", "three"]);
        assert_eq!(input.split(':').filter(|s| !s.is_empty()).count(), 3);
    }

    #[test]
    fn partitioner_greedy_mode_extends_ambiguous_match() {
        let reader = OneByte(Cursor::new(b"XabbY".to_vec()));
        let p = Partitioner::new(Box::new(reader), "ab*", false, true).unwrap();
        assert_eq!(collect_records(p), vec!["X", "Y"]);
    }

    #[test]
    fn partitioner_non_greedy_mode_may_split_at_boundaries() {
        let reader = OneByte(Cursor::new(b"XabbY".to_vec()));
        let p = Partitioner::new(Box::new(reader), "ab*", false, false).unwrap();
        assert_eq!(collect_records(p), vec!["X", "bbY"]);
    }

    // =========================================================================
    // GETLINE AND IO
    // =========================================================================

    #[test]
    fn getline_var_from_main_input() {
        let program = "{ getline nextline; print $0, nextline }";
        let out = run_awk(program, "a\nb\nc\nd\n").unwrap();
        assert_eq!(out, "a b\nc d\n");
    }

    #[test]
    fn getline_updates_nr() {
        let program = "{ getline; print NR, $0 }";
        let out = run_awk(program, "a\nb\nc\nd\n").unwrap();
        assert_eq!(out, "2 b\n4 d\n");
    }

    #[test]
    fn getline_returns_zero_at_eof() {
        let program = "{ r = getline; if (r == 0) print \"eof:\" $0 }";
        let out = run_awk(program, "only\n").unwrap();
        assert_eq!(out, "eof:only\n");
    }

    #[test]
    fn getline_from_missing_file_is_status_minus_one() {
        let program =
            "BEGIN { x = \"keep\"; r = (getline x < \"/hawk/no/such/file\"); print r, x }";
        assert_eq!(run_awk(program, "").unwrap(), "-1 keep\n");
    }

    #[test]
    fn getline_from_file_roundtrip() {
        let path = temp_path("getline");
        std::fs::write(&path, "line one\nline two\n").unwrap();
        let program = "BEGIN { while ((getline row < f) > 0) print \"got\", row }";
        let mut settings = Settings::new();
        settings
            .script_sources
            .push(ScriptSource::from_text(ScriptSource::COMMAND_LINE, program));
        settings
            .variables
            .push(("f".to_string(), Value::from(path.as_str())));
        settings.input = Some(Box::new(Cursor::new(Vec::new())));
        let buf = SharedBuf::default();
        settings.output = Some(Box::new(buf.clone()));
        crate::invoke(settings).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(buf.contents(), "got line one\ngot line two\n");
    }

    #[test]
    fn print_redirection_to_file() {
        let path = temp_path("redirect");
        let program = "BEGIN { print \"first\" > f; print \"second\" > f; close(f); while ((getline row < f) > 0) print row }";
        let mut settings = Settings::new();
        settings
            .script_sources
            .push(ScriptSource::from_text(ScriptSource::COMMAND_LINE, program));
        settings
            .variables
            .push(("f".to_string(), Value::from(path.as_str())));
        settings.input = Some(Box::new(Cursor::new(Vec::new())));
        let buf = SharedBuf::default();
        settings.output = Some(Box::new(buf.clone()));
        crate::invoke(settings).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(buf.contents(), "first\nsecond\n");
    }

    #[test]
    fn getline_from_command_pipe() {
        let program = "BEGIN { \"echo hello\" | getline row; print row }";
        assert_eq!(run_awk(program, "").unwrap(), "hello\n");
    }

    #[test]
    fn system_returns_exit_status() {
        let program = "BEGIN { print system(\"exit 4\") }";
        assert_eq!(run_awk(program, "").unwrap(), "4\n");
    }

    // =========================================================================
    // INPUT CHAIN — files, assignments, FILENAME/FNR
    // =========================================================================

    #[test]
    fn filename_arguments_and_fnr() {
        let p1 = temp_path("chain1");
        let p2 = temp_path("chain2");
        std::fs::write(&p1, "a\nb\n").unwrap();
        std::fs::write(&p2, "c\n").unwrap();

        let mut settings = Settings::new();
        settings.script_sources.push(ScriptSource::from_text(
            ScriptSource::COMMAND_LINE,
            "{ print FNR, NR, $0 }",
        ));
        settings.name_value_or_filenames = vec![p1.clone(), p2.clone()];
        let buf = SharedBuf::default();
        settings.output = Some(Box::new(buf.clone()));
        crate::invoke(settings).unwrap();
        std::fs::remove_file(&p1).ok();
        std::fs::remove_file(&p2).ok();
        assert_eq!(buf.contents(), "1 1 a\n2 2 b\n1 3 c\n");
    }

    #[test]
    fn deferred_assignment_between_files() {
        let p1 = temp_path("defer1");
        std::fs::write(&p1, "data\n").unwrap();

        let mut settings = Settings::new();
        settings.script_sources.push(ScriptSource::from_text(
            ScriptSource::COMMAND_LINE,
            "{ print v, $0 }",
        ));
        settings.name_value_or_filenames = vec!["v=seen".to_string(), p1.clone()];
        let buf = SharedBuf::default();
        settings.output = Some(Box::new(buf.clone()));
        crate::invoke(settings).unwrap();
        std::fs::remove_file(&p1).ok();
        assert_eq!(buf.contents(), "seen data\n");
    }

    #[test]
    fn nextfile_advances_input() {
        let p1 = temp_path("nf1");
        let p2 = temp_path("nf2");
        std::fs::write(&p1, "a\nskip\n").unwrap();
        std::fs::write(&p2, "b\nskip\n").unwrap();

        let mut settings = Settings::new();
        settings.script_sources.push(ScriptSource::from_text(
            ScriptSource::COMMAND_LINE,
            "{ print $1; nextfile }",
        ));
        settings.name_value_or_filenames = vec![p1.clone(), p2.clone()];
        let buf = SharedBuf::default();
        settings.output = Some(Box::new(buf.clone()));
        crate::invoke(settings).unwrap();
        std::fs::remove_file(&p1).ok();
        std::fs::remove_file(&p2).ok();
        assert_eq!(buf.contents(), "a\nb\n");
    }

    #[test]
    fn preassigned_variables() {
        let mut settings = Settings::new();
        settings.script_sources.push(ScriptSource::from_text(
            ScriptSource::COMMAND_LINE,
            "BEGIN { print who, n + 1 }",
        ));
        settings.variables.push(("who".to_string(), Value::from("world")));
        settings.variables.push(("n".to_string(), Value::Int(41)));
        settings.input = Some(Box::new(Cursor::new(Vec::new())));
        let buf = SharedBuf::default();
        settings.output = Some(Box::new(buf.clone()));
        crate::invoke(settings).unwrap();
        assert_eq!(buf.contents(), "world 42\n");
    }

    #[test]
    fn environ_is_populated() {
        // PATH exists in any reasonable test environment
        let out = run_awk("BEGIN { print (ENVIRON[\"PATH\"] != \"\") }", "").unwrap();
        assert_eq!(out, "1\n");
    }

    #[test]
    fn argv_and_argc() {
        let mut settings = Settings::new();
        settings.script_sources.push(ScriptSource::from_text(
            ScriptSource::COMMAND_LINE,
            "BEGIN { print ARGC, ARGV[0], ARGV[1] }",
        ));
        settings.name_value_or_filenames = vec!["x=1".to_string()];
        settings.input = Some(Box::new(Cursor::new(Vec::new())));
        let buf = SharedBuf::default();
        settings.output = Some(Box::new(buf.clone()));
        crate::invoke(settings).unwrap();
        assert_eq!(buf.contents(), "2 awk x=1\n");
    }

    // =========================================================================
    // LOWERING INVARIANTS AND IR
    // =========================================================================

    #[test]
    fn lowering_resolves_every_address() {
        let list = lower(
            "function f(x) { while (x > 0) { x--; if (x == 2) break } return x }
             BEGIN { f(5) }
             /start/,/stop/ { for (k in a) print k }
             END { print \"done\" }",
        );
        assert!(list.fully_resolved());
        assert!(!list.tuples.is_empty());
    }

    #[test]
    fn lowering_skips_input_loop_for_begin_only_programs() {
        let list = lower("BEGIN { print 1 }");
        assert!(list.main_loop.is_none());
        let list = lower("{ print }");
        assert!(list.main_loop.is_some());
        let list = lower("END { print NR }");
        assert!(list.main_loop.is_some());
    }

    #[test]
    fn ir_round_trip_preserves_the_program() {
        let list = lower("BEGIN { x = 1 } { count[$1]++ } END { print length(count) }");
        let bytes = list.to_ir_bytes().unwrap();
        let reloaded = TupleList::from_ir_bytes(&bytes).unwrap();
        assert_eq!(list.tuples, reloaded.tuples);
        assert_eq!(list.num_globals, reloaded.num_globals);

        let mut dump_a = Vec::new();
        let mut dump_b = Vec::new();
        list.dump(&mut dump_a).unwrap();
        reloaded.dump(&mut dump_b).unwrap();
        assert_eq!(dump_a, dump_b);
    }

    #[test]
    fn ir_rejects_bad_magic_and_version() {
        assert!(TupleList::from_ir_bytes(b"{\"magic\":\"other\"}").is_err());
        let list = lower("BEGIN { print 1 }");
        let mut bytes = list.to_ir_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        let tampered = text.replacen(env!("CARGO_PKG_VERSION"), "0.0.0", 1);
        bytes = tampered.into_bytes();
        assert!(TupleList::from_ir_bytes(&bytes).is_err());
    }

    #[test]
    fn intermediate_source_executes() {
        let list = lower("BEGIN { print \"from ir\" }");
        let bytes = list.to_ir_bytes().unwrap();

        let mut settings = Settings::new();
        settings
            .script_sources
            .push(ScriptSource::from_intermediate("test.ai", bytes));
        settings.input = Some(Box::new(Cursor::new(Vec::new())));
        let buf = SharedBuf::default();
        settings.output = Some(Box::new(buf.clone()));
        crate::invoke(settings).unwrap();
        assert_eq!(buf.contents(), "from ir\n");
    }

    // =========================================================================
    // EXTENSIONS
    // =========================================================================

    struct Doubler;

    impl Extension for Doubler {
        fn name(&self) -> &str {
            "doubler"
        }
        fn keywords(&self) -> Vec<&'static str> {
            vec!["_double_it"]
        }
        fn arity(&self, _keyword: &str) -> (usize, usize) {
            (1, 1)
        }
        fn invoke(
            &mut self,
            _keyword: &str,
            args: &[Value],
            _ctx: &mut ExtensionContext,
        ) -> Result<Value, AwkError> {
            Ok(Value::from_f64(args[0].to_number()? * 2.0))
        }
    }

    #[test]
    fn registry_rejects_keyword_collisions() {
        struct Clash;
        impl Extension for Clash {
            fn name(&self) -> &str {
                "clash"
            }
            fn keywords(&self) -> Vec<&'static str> {
                vec!["_double_it"]
            }
            fn arity(&self, _keyword: &str) -> (usize, usize) {
                (0, 0)
            }
            fn invoke(
                &mut self,
                _keyword: &str,
                _args: &[Value],
                _ctx: &mut ExtensionContext,
            ) -> Result<Value, AwkError> {
                Ok(Value::Uninit)
            }
        }

        let mut registry = ExtensionRegistry::new();
        registry.register(Box::new(Doubler)).unwrap();
        let err = registry.register(Box::new(Clash)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
    }

    #[test]
    fn registry_skips_duplicate_registration() {
        let mut registry = ExtensionRegistry::new();
        registry.register(Box::new(Doubler)).unwrap();
        // same extension again: skipped, not an error
        registry.register(Box::new(Doubler)).unwrap();
        assert!(!registry.is_empty());
    }

    #[test]
    fn extension_keyword_dispatches() {
        let mut registry = ExtensionRegistry::new();
        registry.register(Box::new(Doubler)).unwrap();

        let source = "BEGIN { print _double_it(21) }";
        let tokens = Lexer::new(source).tokenize().unwrap();
        let mut ast = Parser::new(tokens)
            .with_extension_keywords(registry.keyword_arities())
            .parse()
            .unwrap();
        let table = semantic::analyze(&mut ast).unwrap();
        let mut settings = Settings::new();
        settings.input = Some(Box::new(Cursor::new(Vec::new())));
        let buf = SharedBuf::default();
        settings.output = Some(Box::new(buf.clone()));
        let list = compiler::compile(&ast, &table, &settings).unwrap();

        let mut avm = crate::vm::Avm::new(settings, registry);
        let code = avm.interpret(list).unwrap();
        assert_eq!(code, 0);
        assert_eq!(buf.contents(), "42\n");
    }

    #[test]
    fn extension_arity_is_checked_at_parse_time() {
        let mut registry = ExtensionRegistry::new();
        registry.register(Box::new(Doubler)).unwrap();

        let tokens = Lexer::new("BEGIN { _double_it(1, 2) }").tokenize().unwrap();
        let err = Parser::new(tokens)
            .with_extension_keywords(registry.keyword_arities())
            .parse()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parser);
    }

    // =========================================================================
    // MISCELLANEOUS SEMANTICS
    // =========================================================================

    #[test]
    fn blank_rule_suppressed_with_extensions_enabled() {
        let mut settings = Settings::new();
        settings.user_extensions = true;
        settings.script_sources.push(ScriptSource::from_text(
            ScriptSource::COMMAND_LINE,
            "/a/",
        ));
        settings.input = Some(Box::new(Cursor::new(b"a\n".to_vec())));
        let buf = SharedBuf::default();
        settings.output = Some(Box::new(buf.clone()));
        crate::invoke(settings).unwrap();
        assert_eq!(buf.contents(), "");
    }

    #[test]
    fn no_input_flag_skips_rules() {
        let mut settings = Settings::new();
        settings.no_auto_input = true;
        settings.script_sources.push(ScriptSource::from_text(
            ScriptSource::COMMAND_LINE,
            "BEGIN { print \"begin\" } { print \"rule\" } END { print \"end\" }",
        ));
        settings.input = Some(Box::new(Cursor::new(b"data\n".to_vec())));
        let buf = SharedBuf::default();
        settings.output = Some(Box::new(buf.clone()));
        crate::invoke(settings).unwrap();
        assert_eq!(buf.contents(), "begin\nend\n");
    }

    #[test]
    fn missing_script_is_a_config_error() {
        let settings = Settings::new();
        let err = crate::invoke(settings).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
    }

    #[test]
    fn multiple_sources_concatenate() {
        let mut settings = Settings::new();
        settings.script_sources.push(ScriptSource::from_text(
            "a.awk",
            "BEGIN { x = 2 }",
        ));
        settings.script_sources.push(ScriptSource::from_text(
            "b.awk",
            "BEGIN { print x * 21 }",
        ));
        settings.input = Some(Box::new(Cursor::new(Vec::new())));
        let buf = SharedBuf::default();
        settings.output = Some(Box::new(buf.clone()));
        crate::invoke(settings).unwrap();
        assert_eq!(buf.contents(), "42\n");
    }

    #[test]
    fn getline_inside_while_condition() {
        let program = "BEGIN { while ((getline line) > 0) n++; print n }";
        assert_eq!(run_awk(program, "a\nb\nc\n").unwrap(), "3\n");
    }

    #[test]
    fn semicolons_separate_statements() {
        assert_eq!(run_awk("BEGIN { x = 1; y = 2; print x + y }", "").unwrap(), "3\n");
    }

    #[test]
    fn nested_function_calls() {
        let program = "function a(x) { return x + 1 } function b(x) { return a(x) * 2 } BEGIN { print b(a(0)) }";
        assert_eq!(run_awk(program, "").unwrap(), "4\n");
    }

    #[test]
    fn string_repetition_via_loop() {
        let program = "BEGIN { s = \"\"; for (i = 0; i < 3; i++) s = s \"ab\"; print s }";
        assert_eq!(run_awk(program, "").unwrap(), "ababab\n");
    }

    #[test]
    fn field_expression_index() {
        let out = run_awk("{ print $(NF - 1) }", "a b c\n").unwrap();
        assert_eq!(out, "b\n");
    }

    #[test]
    fn dollar_binds_tighter_than_increment() {
        let out = run_awk("{ $1++; print $1 }", "7\n").unwrap();
        assert_eq!(out, "8\n");
    }
}
