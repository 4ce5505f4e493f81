//! Question/response label dictionary and the county to metro crosswalk.
//!
//! The dictionary is loaded once per run from four tabular sheets and is
//! read-only afterwards, so it can be shared by reference across estimation
//! workers.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::Read;
use std::str::FromStr;

use csv::StringRecord;
use log::debug;

use crate::error::{PulseError, Result};

/// Survey codes for "skipped" and "not reported".
pub const SKIPPED: i64 = -88;
pub const NOT_REPORTED: i64 = -99;

/// Role of a microdata column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VariableType {
    Id,
    Time,
    Flag,
    Geocode,
    Weight,
    Numeric,
    Question,
}

impl VariableType {
    /// Whether columns of this type are tabulated as questions.
    pub fn is_tabulated(self) -> bool {
        matches!(self, Self::Flag | Self::Numeric | Self::Question)
    }
}

impl FromStr for VariableType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ID" => Ok(Self::Id),
            "TIME" => Ok(Self::Time),
            "FLAG" => Ok(Self::Flag),
            "GEOCODE" => Ok(Self::Geocode),
            "WEIGHT" => Ok(Self::Weight),
            "NUMERIC" => Ok(Self::Numeric),
            "QUESTION" => Ok(Self::Question),
            other => Err(format!("unknown variable type `{other}`")),
        }
    }
}

/// How respondents answer a question.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QuestionType {
    SelectOne,
    /// "Select all that apply": every option is an independent indicator.
    SelectAll,
    YesNo,
    InputValue,
}

impl QuestionType {
    /// Whether a raw code means the respondent is outside the question's universe.
    pub fn is_missing(self, value: i64) -> bool {
        match self {
            Self::SelectAll => value == SKIPPED,
            _ => value == SKIPPED || value == NOT_REPORTED,
        }
    }
}

impl FromStr for QuestionType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "selectone" => Ok(Self::SelectOne),
            "selectall" => Ok(Self::SelectAll),
            "yesno" => Ok(Self::YesNo),
            "inputvalue" => Ok(Self::InputValue),
            _ => Err(format!("unknown question type `{s}`")),
        }
    }
}

/// Metadata for one variable.
#[derive(Clone, Debug, PartialEq)]
pub struct QuestionLabel {
    pub variable: String,
    /// Name this variable is renamed to so that series stay continuous across waves.
    pub variable_recode: Option<String>,
    pub description: String,
    pub universe: String,
    pub variable_type: VariableType,
    pub question_type: Option<QuestionType>,
}

impl QuestionLabel {
    /// Final name of the variable after coalescing.
    pub fn final_name(&self) -> &str {
        self.variable_recode.as_deref().unwrap_or(&self.variable)
    }
}

/// Label and recode for one raw response value.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseLabel {
    pub variable: String,
    pub value: i64,
    pub value_recode: i64,
    pub label: String,
    pub group: String,
    pub do_not_join: bool,
}

/// Core-based statistical area reached from a county.
#[derive(Clone, Debug, PartialEq)]
pub struct MetroArea {
    pub cbsa_code: i64,
    pub title: String,
    pub state: String,
}

/// One bucket `[min_value, max_value]` of a numeric variable.
#[derive(Clone, Debug, PartialEq)]
pub struct NumericBucket {
    pub variable: String,
    pub min_value: i64,
    pub max_value: i64,
    pub bin: i64,
    pub label: String,
}

impl NumericBucket {
    pub fn contains(&self, value: i64) -> bool {
        self.min_value <= value && value <= self.max_value
    }
}

/// Read-only lookup structures built from the dictionary sheets.
#[derive(Clone, Debug, Default)]
pub struct LabelDictionary {
    questions: HashMap<String, QuestionLabel>,
    responses: HashMap<(String, i64), ResponseLabel>,
    recoded: HashMap<(String, i64), (String, i64)>,
    counties: HashMap<i64, MetroArea>,
    metros: HashMap<i64, String>,
    buckets: HashMap<String, Vec<NumericBucket>>,
}

impl LabelDictionary {
    /// Starts building a dictionary from parsed sheets.
    pub fn builder() -> LabelDictionaryBuilder {
        LabelDictionaryBuilder::default()
    }

    /// Parses every sheet from CSV readers and builds the dictionary.
    pub fn from_readers<Q: Read, S: Read, C: Read, N: Read>(
        questions: Q,
        responses: S,
        crosswalk: C,
        numeric: Option<N>,
    ) -> Result<Self> {
        let mut builder = Self::builder()
            .questions(read_question_labels(questions)?)
            .responses(read_response_labels(responses)?)
            .crosswalk(read_crosswalk(crosswalk)?);
        if let Some(reader) = numeric {
            builder = builder.numeric_buckets(read_numeric_buckets(reader)?);
        }
        builder.build()
    }

    /// Looks up a variable by its raw or final name.
    pub fn question(&self, variable: &str) -> Option<&QuestionLabel> {
        self.questions.get(variable)
    }

    /// Looks up the label of a raw response value.
    pub fn response(&self, variable: &str, value: i64) -> Option<&ResponseLabel> {
        self.responses.get(&(variable.to_string(), value))
    }

    /// Question type of a variable, if the dictionary knows it.
    pub fn question_type(&self, variable: &str) -> Option<QuestionType> {
        self.question(variable).and_then(|q| q.question_type)
    }

    /// Whether the variable belongs to a "select all that apply" group.
    pub fn is_select_all(&self, variable: &str) -> bool {
        self.question_type(variable) == Some(QuestionType::SelectAll)
    }

    /// Select-all items among `columns` in the same family as `variable`:
    /// those whose name starts with `variable` minus its last character
    /// (`SEEING1` and `SEEING2` both belong to `SEEING`).
    pub fn select_all_family<'c>(&self, variable: &str, columns: &'c [String]) -> Vec<&'c str> {
        let stem = variable
            .char_indices()
            .last()
            .map(|(end, _)| &variable[..end])
            .unwrap_or_default();
        columns
            .iter()
            .map(String::as_str)
            .filter(|column| column.starts_with(stem) && self.is_select_all(column))
            .collect()
    }

    /// Whether a raw code is a missing code for this variable.
    pub fn is_missing(&self, variable: &str, value: i64) -> bool {
        self.question_type(variable)
            .unwrap_or(QuestionType::SelectOne)
            .is_missing(value)
    }

    /// Recoded value for a raw response; values without an entry are kept.
    pub fn recode(&self, variable: &str, value: i64) -> i64 {
        self.response(variable, value)
            .map(|r| r.value_recode)
            .unwrap_or(value)
    }

    /// Label joined onto a recoded value, unless the entry is flagged `do_not_join`.
    pub fn recoded_label(&self, variable: &str, recoded: i64) -> Option<&str> {
        let raw = self.recoded.get(&(variable.to_string(), recoded))?;
        let response = self.responses.get(raw)?;
        if response.do_not_join {
            None
        } else {
            Some(response.label.as_str())
        }
    }

    /// Group tag of a recoded value (used by the front-end cache).
    pub fn recoded_group(&self, variable: &str, recoded: i64) -> Option<&str> {
        let raw = self.recoded.get(&(variable.to_string(), recoded))?;
        self.responses
            .get(raw)
            .map(|r| r.group.as_str())
            .filter(|g| !g.is_empty())
    }

    /// Distinct recoded response values listed for a variable, ascending.
    pub fn response_values(&self, variable: &str) -> BTreeSet<i64> {
        self.responses
            .values()
            .filter(|r| r.variable == variable && !self.is_missing(variable, r.value))
            .map(|r| r.value_recode)
            .collect()
    }

    /// Pairs `(raw name, final name)` of variables that are renamed across waves.
    pub fn variable_renames(&self) -> impl Iterator<Item = (&str, &str)> {
        self.questions.values().filter_map(|q| {
            q.variable_recode
                .as_deref()
                .filter(|recode| *recode != q.variable)
                .map(|recode| (q.variable.as_str(), recode))
        })
    }

    /// Metro area for a county FIPS code.
    pub fn metro_for_county(&self, county_fips: i64) -> Option<&MetroArea> {
        self.counties.get(&county_fips)
    }

    /// Display title of a CBSA code.
    pub fn metro_title(&self, cbsa_code: i64) -> Option<&str> {
        self.metros.get(&cbsa_code).map(String::as_str)
    }

    /// Buckets defined for a numeric variable, sorted by lower bound.
    pub fn buckets(&self, variable: &str) -> Option<&[NumericBucket]> {
        self.buckets.get(variable).map(Vec::as_slice)
    }

    /// Names of every variable with bucket definitions.
    pub fn bucketed_variables(&self) -> impl Iterator<Item = &str> {
        self.buckets.keys().map(String::as_str)
    }

    /// Number of question entries.
    pub fn question_count(&self) -> usize {
        self.questions.len()
    }
}

/// Builder that validates the parsed sheets before constructing a [`LabelDictionary`].
#[derive(Debug, Default)]
pub struct LabelDictionaryBuilder {
    questions: Option<Vec<QuestionLabel>>,
    responses: Option<Vec<ResponseLabel>>,
    crosswalk: Option<Vec<(i64, MetroArea)>>,
    buckets: Vec<NumericBucket>,
}

impl LabelDictionaryBuilder {
    /// Sets the question labels.
    pub fn questions(mut self, questions: Vec<QuestionLabel>) -> Self {
        self.questions = Some(questions);
        self
    }

    /// Sets the response labels.
    pub fn responses(mut self, responses: Vec<ResponseLabel>) -> Self {
        self.responses = Some(responses);
        self
    }

    /// Sets the `(county fips, metro)` crosswalk rows.
    pub fn crosswalk(mut self, rows: Vec<(i64, MetroArea)>) -> Self {
        self.crosswalk = Some(rows);
        self
    }

    /// Sets numeric bucket definitions.
    pub fn numeric_buckets(mut self, buckets: Vec<NumericBucket>) -> Self {
        self.buckets = buckets;
        self
    }

    /// Finalizes construction after checking keys are unique and buckets well formed.
    pub fn build(self) -> Result<LabelDictionary> {
        let question_rows = self
            .questions
            .ok_or_else(|| PulseError::dictionary("question_labels", "sheet not provided"))?;
        let response_rows = self
            .responses
            .ok_or_else(|| PulseError::dictionary("response_labels", "sheet not provided"))?;
        let crosswalk_rows = self
            .crosswalk
            .ok_or_else(|| PulseError::dictionary("county_metro_state", "sheet not provided"))?;

        let mut questions = HashMap::with_capacity(question_rows.len() * 2);
        let mut listed = HashSet::with_capacity(question_rows.len());
        for question in question_rows {
            if !listed.insert(question.variable.clone()) {
                return Err(PulseError::dictionary(
                    "question_labels",
                    format!("variable `{}` listed twice", question.variable),
                ));
            }
            // Renamed variables are reachable under their final name as well.
            if let Some(recode) = question.variable_recode.clone() {
                questions.entry(recode.clone()).or_insert_with(|| QuestionLabel {
                    variable: recode,
                    variable_recode: None,
                    ..question.clone()
                });
            }
            questions.insert(question.variable.clone(), question);
        }

        let mut responses = HashMap::with_capacity(response_rows.len());
        let mut recoded = HashMap::new();
        for response in response_rows {
            let key = (response.variable.clone(), response.value);
            if responses.contains_key(&key) {
                debug!(
                    "duplicate response entry {}={} ignored",
                    response.variable, response.value
                );
                continue;
            }
            recoded
                .entry((response.variable.clone(), response.value_recode))
                .or_insert_with(|| key.clone());
            responses.insert(key, response);
        }

        let mut counties = HashMap::with_capacity(crosswalk_rows.len());
        let mut metros = HashMap::new();
        for (county, metro) in crosswalk_rows {
            metros
                .entry(metro.cbsa_code)
                .or_insert_with(|| metro.title.clone());
            counties.entry(county).or_insert(metro);
        }

        let mut buckets: HashMap<String, Vec<NumericBucket>> = HashMap::new();
        for bucket in self.buckets {
            if bucket.min_value > bucket.max_value {
                return Err(PulseError::dictionary(
                    "numeric_mapping",
                    format!(
                        "bucket {} of `{}` has min {} above max {}",
                        bucket.bin, bucket.variable, bucket.min_value, bucket.max_value
                    ),
                ));
            }
            buckets
                .entry(bucket.variable.clone())
                .or_default()
                .push(bucket);
        }
        for (variable, list) in buckets.iter_mut() {
            list.sort_by_key(|b| b.min_value);
            if list.windows(2).any(|w| w[1].min_value <= w[0].max_value) {
                return Err(PulseError::dictionary(
                    "numeric_mapping",
                    format!("buckets of `{variable}` overlap"),
                ));
            }
        }

        Ok(LabelDictionary {
            questions,
            responses,
            recoded,
            counties,
            metros,
            buckets,
        })
    }
}

/// Parses an integer survey code, accepting float renderings such as `"3.0"`.
pub(crate) fn parse_code(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if let Ok(value) = trimmed.parse::<i64>() {
        return Some(value);
    }
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() && value.fract() == 0.0 => Some(value as i64),
        _ => None,
    }
}

/// A CSV sheet whose header has been checked for required columns.
struct Sheet<R> {
    name: &'static str,
    reader: csv::Reader<R>,
    columns: HashMap<String, usize>,
}

impl<R: Read> Sheet<R> {
    fn open(name: &'static str, reader: R, required: &[&str]) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);
        let headers = reader
            .headers()
            .map_err(|e| PulseError::dictionary(name, e.to_string()))?;
        let columns: HashMap<String, usize> = headers
            .iter()
            .enumerate()
            .map(|(index, header)| (header.to_string(), index))
            .collect();
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|column| !columns.contains_key(*column))
            .collect();
        if !missing.is_empty() {
            return Err(PulseError::dictionary(
                name,
                format!("missing required columns: {}", missing.join(", ")),
            ));
        }
        Ok(Self {
            name,
            reader,
            columns,
        })
    }

    fn rows(&mut self) -> Result<Vec<StringRecord>> {
        let name = self.name;
        self.reader
            .records()
            .map(|record| record.map_err(|e| PulseError::dictionary(name, e.to_string())))
            .collect()
    }

    fn text<'r>(&self, record: &'r StringRecord, column: &str) -> Option<&'r str> {
        self.columns
            .get(column)
            .and_then(|index| record.get(*index))
            .filter(|value| !value.is_empty())
    }

    fn required_text<'r>(&self, record: &'r StringRecord, column: &str) -> Result<&'r str> {
        self.text(record, column).ok_or_else(|| {
            PulseError::dictionary(
                self.name,
                format!("empty `{column}` at line {}", line_of(record)),
            )
        })
    }

    fn code(&self, record: &StringRecord, column: &str) -> Result<Option<i64>> {
        match self.text(record, column) {
            None => Ok(None),
            Some(raw) => parse_code(raw).map(Some).ok_or_else(|| {
                PulseError::dictionary(
                    self.name,
                    format!(
                        "`{column}` value `{raw}` at line {} is not an integer",
                        line_of(record)
                    ),
                )
            }),
        }
    }

    fn required_code(&self, record: &StringRecord, column: &str) -> Result<i64> {
        self.code(record, column)?.ok_or_else(|| {
            PulseError::dictionary(
                self.name,
                format!("empty `{column}` at line {}", line_of(record)),
            )
        })
    }
}

fn line_of(record: &StringRecord) -> u64 {
    record.position().map(|p| p.line()).unwrap_or(0)
}

fn parse_flag(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|s| s.to_ascii_lowercase()).as_deref(),
        Some("1" | "1.0" | "true" | "yes" | "y")
    )
}

/// Reads `question_labels`: `variable, description, universe, type_of_variable`
/// plus optional `variable_recode` and `question_type`.
pub fn read_question_labels<R: Read>(reader: R) -> Result<Vec<QuestionLabel>> {
    let mut sheet = Sheet::open(
        "question_labels",
        reader,
        &["variable", "description", "universe", "type_of_variable"],
    )?;
    let mut labels = Vec::new();
    for record in sheet.rows()? {
        let variable = sheet.required_text(&record, "variable")?.to_string();
        let variable_type = sheet
            .required_text(&record, "type_of_variable")?
            .parse::<VariableType>()
            .map_err(|reason| PulseError::dictionary("question_labels", reason))?;
        let question_type = sheet
            .text(&record, "question_type")
            .map(QuestionType::from_str)
            .transpose()
            .map_err(|reason| PulseError::dictionary("question_labels", reason))?;
        labels.push(QuestionLabel {
            variable,
            variable_recode: sheet.text(&record, "variable_recode").map(str::to_string),
            description: sheet
                .text(&record, "description")
                .unwrap_or_default()
                .to_string(),
            universe: sheet
                .text(&record, "universe")
                .unwrap_or_default()
                .to_string(),
            variable_type,
            question_type,
        });
    }
    Ok(labels)
}

/// Reads `response_labels`: `variable, value, label` plus optional
/// `value_recode`, `variable_group` and `do_not_join`.
pub fn read_response_labels<R: Read>(reader: R) -> Result<Vec<ResponseLabel>> {
    let mut sheet = Sheet::open("response_labels", reader, &["variable", "value", "label"])?;
    let mut labels = Vec::new();
    for record in sheet.rows()? {
        let value = sheet.required_code(&record, "value")?;
        labels.push(ResponseLabel {
            variable: sheet.required_text(&record, "variable")?.to_string(),
            value,
            value_recode: sheet.code(&record, "value_recode")?.unwrap_or(value),
            label: sheet.text(&record, "label").unwrap_or_default().to_string(),
            group: sheet
                .text(&record, "variable_group")
                .unwrap_or_default()
                .to_string(),
            do_not_join: parse_flag(sheet.text(&record, "do_not_join")),
        });
    }
    Ok(labels)
}

/// Reads `county_metro_state`: `county_fips, cbsa_fips, cbsa_title` plus optional `state`.
pub fn read_crosswalk<R: Read>(reader: R) -> Result<Vec<(i64, MetroArea)>> {
    let mut sheet = Sheet::open(
        "county_metro_state",
        reader,
        &["county_fips", "cbsa_fips", "cbsa_title"],
    )?;
    let mut rows = Vec::new();
    for record in sheet.rows()? {
        let county = sheet.required_code(&record, "county_fips")?;
        rows.push((
            county,
            MetroArea {
                cbsa_code: sheet.required_code(&record, "cbsa_fips")?,
                title: sheet.required_text(&record, "cbsa_title")?.to_string(),
                state: sheet.text(&record, "state").unwrap_or_default().to_string(),
            },
        ));
    }
    Ok(rows)
}

/// Reads `numeric_mapping`: `variable, min_value, max_value, bin` plus optional `label`.
pub fn read_numeric_buckets<R: Read>(reader: R) -> Result<Vec<NumericBucket>> {
    let mut sheet = Sheet::open(
        "numeric_mapping",
        reader,
        &["variable", "min_value", "max_value", "bin"],
    )?;
    let mut buckets = Vec::new();
    for record in sheet.rows()? {
        buckets.push(NumericBucket {
            variable: sheet.required_text(&record, "variable")?.to_string(),
            min_value: sheet.required_code(&record, "min_value")?,
            max_value: sheet.required_code(&record, "max_value")?,
            bin: sheet.required_code(&record, "bin")?,
            label: sheet.text(&record, "label").unwrap_or_default().to_string(),
        });
    }
    Ok(buckets)
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUESTIONS: &str = "\
variable,variable_recode,description,universe,type_of_variable,question_type
SCRAM,,Respondent id,All,ID,
ANXIOUS,,Felt anxious,All adults,QUESTION,Select one
WRKLOSS,WRKLOSSRV,Lost work,All adults,QUESTION,Yes / No
SEEING1,,Had trouble seeing,All adults,QUESTION,Select all
SEEING2,,Had trouble seeing with glasses,All adults,QUESTION,Select all
EST_MSA,,Metro area,All,GEOCODE,
";

    const RESPONSES: &str = "\
variable,value,value_recode,label,variable_group,do_not_join
ANXIOUS,1,1,Not at all,anxiety,
ANXIOUS,2,2,Several days,anxiety,
ANXIOUS,3,2,More than half the days,anxiety,
ANXIOUS,4,3,Nearly every day,anxiety,
SEEING1,1,1,Selected,seeing,
SEEING1,-99,0,Not selected,seeing,1
";

    const CROSSWALK: &str = "\
county_fips,cbsa_fips,cbsa_title,state
17031,16980,Chicago-Naperville-Elgin,IL
17043,16980,Chicago-Naperville-Elgin,IL
6037,31080,Los Angeles-Long Beach-Anaheim,CA
";

    const NUMERIC: &str = "\
variable,min_value,max_value,bin,label
TBIRTH_YEAR,18,24,1,18 - 24
TBIRTH_YEAR,25,39,2,25 - 39
TBIRTH_YEAR,40,120,3,40+
";

    fn dictionary() -> LabelDictionary {
        LabelDictionary::from_readers(
            QUESTIONS.as_bytes(),
            RESPONSES.as_bytes(),
            CROSSWALK.as_bytes(),
            Some(NUMERIC.as_bytes()),
        )
        .expect("valid dictionary")
    }

    #[test]
    fn lookups_by_variable_and_value() {
        let dict = dictionary();
        let anxious = dict.question("ANXIOUS").unwrap();
        assert_eq!(anxious.variable_type, VariableType::Question);
        assert_eq!(anxious.question_type, Some(QuestionType::SelectOne));
        assert_eq!(dict.response("ANXIOUS", 3).unwrap().value_recode, 2);
        assert_eq!(dict.recode("ANXIOUS", 4), 3);
        assert_eq!(dict.recode("ANXIOUS", 9), 9);
        assert_eq!(dict.recoded_label("ANXIOUS", 2), Some("Several days"));
        let values: Vec<i64> = dict.response_values("ANXIOUS").into_iter().collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn do_not_join_rows_keep_recode_but_drop_label() {
        let dict = dictionary();
        assert_eq!(dict.recode("SEEING1", -99), 0);
        assert_eq!(dict.recoded_label("SEEING1", 0), None);
        assert!(dict.is_select_all("SEEING1"));
        assert!(!dict.is_missing("SEEING1", -99));
        assert!(dict.is_missing("ANXIOUS", -99));
    }

    #[test]
    fn select_all_family_shares_the_stem() {
        let dict = dictionary();
        let columns: Vec<String> = ["SEEING1", "ANXIOUS", "SEEING2", "SEEINGX"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        assert_eq!(dict.select_all_family("SEEING2", &columns), vec!["SEEING1", "SEEING2"]);
        assert!(dict.select_all_family("ANXIOUS", &columns).is_empty());
    }

    #[test]
    fn renamed_variables_resolve_under_both_names() {
        let dict = dictionary();
        let renames: Vec<(&str, &str)> = dict.variable_renames().collect();
        assert_eq!(renames, vec![("WRKLOSS", "WRKLOSSRV")]);
        assert_eq!(
            dict.question("WRKLOSSRV").unwrap().question_type,
            Some(QuestionType::YesNo)
        );
    }

    #[test]
    fn crosswalk_deduplicates_metros() {
        let dict = dictionary();
        assert_eq!(dict.metro_for_county(17043).unwrap().cbsa_code, 16980);
        assert_eq!(dict.metro_title(31080), Some("Los Angeles-Long Beach-Anaheim"));
        assert_eq!(dict.buckets("TBIRTH_YEAR").unwrap().len(), 3);
    }

    #[test]
    fn missing_columns_fail_with_dictionary_error() {
        let result = LabelDictionary::from_readers(
            "variable,description\nANXIOUS,Felt anxious\n".as_bytes(),
            RESPONSES.as_bytes(),
            CROSSWALK.as_bytes(),
            None::<&[u8]>,
        );
        match result {
            Err(PulseError::DictionaryLoad { sheet, reason }) => {
                assert_eq!(sheet, "question_labels");
                assert!(reason.contains("universe"));
                assert!(reason.contains("type_of_variable"));
            }
            other => panic!("expected dictionary error, got {other:?}"),
        }
    }

    #[test]
    fn overlapping_buckets_are_rejected() {
        let numeric = "variable,min_value,max_value,bin\nAGE,18,30,1\nAGE,30,40,2\n";
        let result = LabelDictionary::from_readers(
            QUESTIONS.as_bytes(),
            RESPONSES.as_bytes(),
            CROSSWALK.as_bytes(),
            Some(numeric.as_bytes()),
        );
        assert!(matches!(result, Err(PulseError::DictionaryLoad { .. })));
    }

    #[test]
    fn float_rendered_codes_parse() {
        assert_eq!(parse_code("3.0"), Some(3));
        assert_eq!(parse_code("-99"), Some(-99));
        assert_eq!(parse_code("2.5"), None);
        assert_eq!(parse_code("abc"), None);
    }
}
