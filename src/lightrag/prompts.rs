//! Prompt templates for extraction, keyword detection, summaries and answers.
//!
//! Placeholders are written `{name}` and filled by [`render`].

pub const TUPLE_DELIMITER: &str = "<|>";
pub const RECORD_DELIMITER: &str = "##";
pub const COMPLETION_DELIMITER: &str = "<|COMPLETE|>";

/// Replace every `{key}` in `template` with its value.
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

pub const ENTITY_EXTRACTION: &str = r#"---Goal---
Given a text document and a list of entity types, identify all entities of those types in the text and all relationships among the identified entities.
Use {language} as output language.

---Steps---
1. Identify all entities. For each identified entity, extract:
- entity_name: Name of the entity, use the same language as the input text. Capitalize the name if it is English.
- entity_type: One of the following types: [{entity_types}]
- entity_description: Comprehensive description of the entity's attributes and activities, based only on the input text.
Format each entity as ("entity"{tuple_delimiter}<entity_name>{tuple_delimiter}<entity_type>{tuple_delimiter}<entity_description>)

2. From the entities identified in step 1, identify all pairs of (source_entity, target_entity) that are clearly related to each other.
For each pair of related entities, extract:
- source_entity: name of the source entity, as identified in step 1
- target_entity: name of the target entity, as identified in step 1
- relationship_description: explanation of why the source and target entities are related
- relationship_keywords: one or more high-level keywords that summarize the nature of the relationship
- relationship_strength: a numeric score from 1 to 10 indicating the strength of the relationship
Format each relationship as ("relationship"{tuple_delimiter}<source_entity>{tuple_delimiter}<target_entity>{tuple_delimiter}<relationship_description>{tuple_delimiter}<relationship_keywords>{tuple_delimiter}<relationship_strength>)

3. Return output in {language} as a single list of all the entities and relationships identified in steps 1 and 2. Use **{record_delimiter}** as the list delimiter.

4. When finished, output {completion_delimiter}

---Example---
Entity_types: [Person, Organization, Technology]
Text:
Dr. Mira Chen joined Helix Labs in 2021 to lead the team building Tesseract, a vector database used by the lab's search products.
Output:
("entity"{tuple_delimiter}"Mira Chen"{tuple_delimiter}"Person"{tuple_delimiter}"Mira Chen is a researcher who joined Helix Labs in 2021 and leads the Tesseract team."){record_delimiter}
("entity"{tuple_delimiter}"Helix Labs"{tuple_delimiter}"Organization"{tuple_delimiter}"Helix Labs is a lab that builds search products."){record_delimiter}
("entity"{tuple_delimiter}"Tesseract"{tuple_delimiter}"Technology"{tuple_delimiter}"Tesseract is a vector database used by Helix Labs' search products."){record_delimiter}
("relationship"{tuple_delimiter}"Mira Chen"{tuple_delimiter}"Helix Labs"{tuple_delimiter}"Mira Chen joined Helix Labs in 2021."{tuple_delimiter}"employment"{tuple_delimiter}8){record_delimiter}
("relationship"{tuple_delimiter}"Mira Chen"{tuple_delimiter}"Tesseract"{tuple_delimiter}"Mira Chen leads the team building Tesseract."{tuple_delimiter}"leadership, development"{tuple_delimiter}9){record_delimiter}
("relationship"{tuple_delimiter}"Helix Labs"{tuple_delimiter}"Tesseract"{tuple_delimiter}"Helix Labs uses Tesseract in its search products."{tuple_delimiter}"product usage"{tuple_delimiter}7){completion_delimiter}

---Real Data---
Entity_types: [{entity_types}]
Text:
{input_text}
Output:
"#;

pub const ENTITY_CONTINUE_EXTRACTION: &str = r#"MANY entities and relationships were missed in the last extraction.

---Remember Steps---
Add any missing entities and relationships using the same format as before:
("entity"{tuple_delimiter}<entity_name>{tuple_delimiter}<entity_type>{tuple_delimiter}<entity_description>)
("relationship"{tuple_delimiter}<source_entity>{tuple_delimiter}<target_entity>{tuple_delimiter}<relationship_description>{tuple_delimiter}<relationship_keywords>{tuple_delimiter}<relationship_strength>)
Entity types must be one of: [{entity_types}]. Use {record_delimiter} between records and finish with {completion_delimiter}. Use {language} as output language.

Output:
"#;

pub const KEYWORDS_EXTRACTION: &str = r#"---Role---
You are a helpful assistant tasked with identifying both high-level and low-level keywords in the user's query and conversation history.

---Goal---
Given the query and conversation history, list both high-level and low-level keywords. High-level keywords focus on overarching concepts or themes, while low-level keywords focus on specific entities, details, or concrete terms.

---Instructions---
- Consider both the current query and relevant conversation history when extracting keywords
- Output the keywords in JSON format, it will be parsed by a JSON parser, do not add any extra content in output
- The JSON should have two keys:
  - "high_level_keywords" for overarching concepts or themes
  - "low_level_keywords" for specific entities or details

---Example---
Query: "How does international trade influence global economic stability?"
Output:
{"high_level_keywords": ["International trade", "Global economic stability", "Economic impact"], "low_level_keywords": ["Trade agreements", "Tariffs", "Currency exchange", "Imports", "Exports"]}

---Real Data---
Conversation History:
{history}

Current Query: {query}

Output:
"#;

pub const SUMMARIZE_DESCRIPTIONS: &str = r#"You are a helpful assistant responsible for generating a comprehensive summary of the data provided below.
Given one or two entities, and a list of descriptions, all related to the same entity or group of entities.
Please concatenate all of these into a single, comprehensive description. Make sure to include information collected from all the descriptions.
If the provided descriptions are contradictory, please resolve the contradictions and provide a single, coherent summary.
Make sure it is written in third person, and include the entity names so we have the full context.
Use {language} as output language.

#######
---Data---
Entities: {entity_name}
Description List: {description_list}
#######
Output:
"#;

pub const RAG_RESPONSE: &str = r#"---Role---

You are a helpful assistant responding to user query about Knowledge Graph and Document Chunks provided in JSON format below.

---Goal---

Generate a concise response based on Knowledge Base and follow Response Rules, considering both the conversation history and the current query. Summarize all information in the provided Knowledge Base, and incorporate general knowledge relevant to the Knowledge Base. Do not include information not provided by Knowledge Base.

---Conversation History---
{history}

---Knowledge Graph and Document Chunks---
{context_data}

---Response Rules---

- Target format and length: {response_type}
- Use markdown formatting with appropriate section headings
- Please respond in the same language as the user's question.
- Ensure the response maintains continuity with the conversation history.
- List up to 5 most important reference sources at the end under "References" section, indicating the file path of each source.
- If you don't know the answer, just say so.
- Do not make anything up. Do not include information not provided by the Knowledge Base.
- Additional user prompt: {user_prompt}

Response:"#;

pub const NAIVE_RAG_RESPONSE: &str = r#"---Role---

You are a helpful assistant responding to user query about Document Chunks provided in JSON format below.

---Goal---

Generate a concise response based on Document Chunks and follow Response Rules, considering both the conversation history and the current query. Summarize all information in the provided Document Chunks. Do not include information not provided by Document Chunks.

---Conversation History---
{history}

---Document Chunks(DC)---
{content_data}

---Response Rules---

- Target format and length: {response_type}
- Use markdown formatting with appropriate section headings
- Please respond in the same language as the user's question.
- Ensure the response maintains continuity with the conversation history.
- List up to 5 most important reference sources at the end under "References" section, indicating the file path of each source.
- If you don't know the answer, just say so.
- Do not include information not provided by the Document Chunks.
- Additional user prompt: {user_prompt}

Response:"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_fills_all_placeholders() {
        let text = render(
            ENTITY_CONTINUE_EXTRACTION,
            &[
                ("tuple_delimiter", TUPLE_DELIMITER),
                ("record_delimiter", RECORD_DELIMITER),
                ("completion_delimiter", COMPLETION_DELIMITER),
                ("entity_types", "Person"),
                ("language", "English"),
            ],
        );
        assert!(!text.contains("{tuple_delimiter}"));
        assert!(text.contains("<|COMPLETE|>"));
        assert!(text.contains("[Person]"));
    }

    #[test]
    fn render_leaves_json_braces_alone() {
        let text = render(KEYWORDS_EXTRACTION, &[("query", "q"), ("history", "")]);
        assert!(text.contains("\"high_level_keywords\""));
        assert!(text.contains("Current Query: q"));
    }
}
