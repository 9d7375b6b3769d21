use crate::{
    error::{Error, Result},
    token::{Attr, Function, Global, Kind, Literal, Token, tokenize},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Dot,
    Assign,
}

/// Expression tree. Built per evaluation and dropped afterwards.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Global(Global),
    Attr(Attr),
    Variable(String),
    Literal(Literal),
    Binary {
        op: BinaryOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Call {
        function: Function,
        args: Vec<Node>,
    },
}

impl Node {
    fn binary(op: BinaryOp, left: Node, right: Node) -> Self {
        Node::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Short description used in error messages.
    pub const fn describe(&self) -> &'static str {
        match self {
            Node::Global(_) => "a global",
            Node::Attr(_) => "an attribute",
            Node::Variable(_) => "an identifier",
            Node::Literal(Literal::Int(_) | Literal::Float(_)) => "a number",
            Node::Literal(Literal::Str(_)) => "a string",
            Node::Binary {
                op: BinaryOp::Dot, ..
            } => "an attribute path",
            Node::Binary {
                op: BinaryOp::Assign,
                ..
            } => "an assignment",
            Node::Call { .. } => "a function call",
        }
    }
}

/// Parses `source` into a single expression tree.
///
/// # Errors
///
/// Returns lexing errors from [`tokenize`], [`Error::UnexpectedToken`] when
/// the token stream does not match the grammar (trailing input included) and
/// [`Error::TooDeep`] past [`MAX_DEPTH`] levels of nesting.
pub fn parse(source: &str) -> Result<Node> {
    let mut cursor = Cursor::new(tokenize(source)?);
    let node = parse_expr(&mut cursor)?;
    cursor.expect(Kind::Eof, "end of input")?;
    Ok(node)
}

/// Deepest tree [`parse`] builds. Evaluating and dropping a tree both recurse
/// once per level.
pub const MAX_DEPTH: usize = 64;

/// Read position over a token stream. Owned by a single parse.
struct Cursor {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Cursor {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    /// Enters one tree level. A failed parse is abandoned, so only the
    /// success paths call [`Cursor::ascend`].
    fn descend(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(Error::TooDeep {
                limit: MAX_DEPTH,
                offset: self.peek().offset,
            });
        }
        Ok(())
    }

    fn ascend(&mut self, levels: usize) {
        self.depth -= levels;
    }

    fn peek(&self) -> &Token {
        // `tokenize` always terminates the stream with Eof and the cursor
        // never advances past it.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn next(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != Kind::Eof {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: Kind) -> bool {
        if self.peek().kind == kind {
            self.next();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: Kind, expected: &'static str) -> Result<Token> {
        if self.peek().kind == kind {
            Ok(self.next())
        } else {
            Err(unexpected(self.peek(), expected))
        }
    }
}

fn unexpected(token: &Token, expected: &'static str) -> Error {
    Error::UnexpectedToken {
        expected,
        found: token.kind.to_string(),
        offset: token.offset,
    }
}

fn parse_expr(cursor: &mut Cursor) -> Result<Node> {
    cursor.descend()?;
    let mut node = parse_path(cursor)?;
    if cursor.eat(Kind::Assign) {
        let right = parse_expr(cursor)?;
        node = Node::binary(BinaryOp::Assign, node, right);
    }
    cursor.ascend(1);
    Ok(node)
}

fn parse_path(cursor: &mut Cursor) -> Result<Node> {
    let mut node = parse_atom(cursor)?;
    let mut dots = 0;
    while cursor.eat(Kind::Dot) {
        // Each dot wraps the whole path so far in one more level.
        cursor.descend()?;
        dots += 1;
        let right = parse_atom(cursor)?;
        node = Node::binary(BinaryOp::Dot, node, right);
    }
    cursor.ascend(dots);
    Ok(node)
}

fn parse_atom(cursor: &mut Cursor) -> Result<Node> {
    const EXPECTED: &str = "a global, attribute, identifier, literal or call";

    let token = cursor.next();
    match (token.kind, token.value) {
        (Kind::Global(global), _) => Ok(Node::Global(global)),
        (Kind::Attr(attr), _) => Ok(Node::Attr(attr)),
        (Kind::Function(function), _) => parse_call(cursor, function),
        (Kind::Identifier, Some(Literal::Str(name))) => Ok(Node::Variable(name)),
        (Kind::Number | Kind::Real | Kind::String, Some(literal)) => Ok(Node::Literal(literal)),
        (kind, value) => Err(unexpected(
            &Token {
                kind,
                value,
                offset: token.offset,
            },
            EXPECTED,
        )),
    }
}

fn parse_call(cursor: &mut Cursor, function: Function) -> Result<Node> {
    cursor.expect(Kind::LeftParen, "`(`")?;
    let mut args = vec![parse_expr(cursor)?];
    while cursor.eat(Kind::Comma) {
        args.push(parse_expr(cursor)?);
    }
    cursor.expect(Kind::RightParen, "`,` or `)`")?;
    Ok(Node::Call { function, args })
}
