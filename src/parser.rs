use std::collections::HashMap;
use std::io::Read;

use csv::StringRecord;

use crate::error::ParseError;
use crate::models::GradeRecord;

pub const STUDENT_ID: &str = "student_id";
pub const STUDENT_NAME: &str = "student_name";
pub const SUBJECT: &str = "subject";
pub const GRADE: &str = "grade";

/// Column positions resolved from the header line.
#[derive(Debug, Clone, Copy)]
struct Columns {
    id: usize,
    student_name: usize,
    subject: usize,
    grade: usize,
}

impl Columns {
    fn from_header(header: &StringRecord) -> Result<Self, ParseError> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (position, name) in header.iter().enumerate() {
            index.insert(name, position);
        }

        let lookup = |name: &'static str| {
            index
                .get(name)
                .copied()
                .ok_or(ParseError::MissingField(name))
        };

        Ok(Self {
            id: lookup(STUDENT_ID)?,
            student_name: lookup(STUDENT_NAME)?,
            subject: lookup(SUBJECT)?,
            grade: lookup(GRADE)?,
        })
    }
}

/// Parses a whole grades CSV into records, in file order.
///
/// Columns are matched by header name, so their order does not matter. The
/// first bad row aborts the file: no partial record list is returned.
pub fn parse<R: Read>(input: R) -> Result<Vec<GradeRecord>, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(input);

    let columns = Columns::from_header(reader.headers()?)?;

    let mut grades = Vec::new();
    let mut record = StringRecord::new();
    while reader.read_record(&mut record)? {
        grades.push(to_grade(&record, columns)?);
    }

    Ok(grades)
}

fn to_grade(record: &StringRecord, columns: Columns) -> Result<GradeRecord, ParseError> {
    let line = record.position().map(|pos| pos.line()).unwrap_or_default();
    let field = |position: usize| {
        record.get(position).ok_or_else(|| ParseError::Malformed {
            line,
            message: format!("missing field at column {}", position + 1),
        })
    };

    let raw_grade = field(columns.grade)?;
    let grade = raw_grade
        .parse::<i32>()
        .map_err(|_| ParseError::InvalidGrade {
            value: raw_grade.to_string(),
            line,
        })?;

    Ok(GradeRecord {
        id: field(columns.id)?.to_string(),
        student_name: field(columns.student_name)?.to_string(),
        subject: field(columns.subject)?.to_string(),
        grade,
    })
}
